//! Request arguments and paginated results

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::sortable::SortDirection;
use crate::data::executor::Row;
use crate::domain::filters::{Context, FilterTree};

/// Arguments for [`super::QueryLoader::load`] and [`super::QueryLoader::load_pagination`]
///
/// Deserializes from the camelCase request shape (`orderBy`, `searchAfter`,
/// `takeCount`, ...). `orderBy` and `distinctOn` accept a single entry or a list.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadArgs {
    /// Field names to return; empty means every selectable field
    pub select: Vec<String>,
    #[serde(rename = "where")]
    pub filter: FilterTree,
    /// Page size. Negative values page backwards from the cursor.
    pub take: Option<i64>,
    pub skip: Option<i64>,
    pub cursor: Option<String>,
    /// Explicit cursor position keyed by sortable name
    pub search_after: Option<Map<String, Value>>,
    #[serde(deserialize_with = "one_or_many")]
    pub order_by: Vec<(String, SortDirection)>,
    #[serde(deserialize_with = "one_or_many")]
    pub distinct_on: Vec<String>,
    pub take_count: bool,
    pub take_cursors: bool,
    /// Look-ahead in pages, used to report `minimum_count`
    pub take_next_pages: Option<i64>,
    pub select_groups: Vec<String>,
    pub ctx: Context,
}

impl LoadArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: FilterTree) -> Self {
        self.filter = filter;
        self
    }

    pub fn take(mut self, take: i64) -> Self {
        self.take = Some(take);
        self
    }

    pub fn skip(mut self, skip: i64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn order_by(mut self, name: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push((name.into(), direction));
        self
    }

    pub fn ctx(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
    })
}

/// Position information for one page
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_previous_page: bool,
    pub has_next_page: bool,
    /// Rows known to exist up to the end of the look-ahead window
    pub minimum_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_cursor: Option<String>,
    /// Total matching rows, only when `take_count` was requested
    pub count: Option<i64>,
}

/// One page of results
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub nodes: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursors: Option<Vec<Option<String>>>,
    pub page_info: PageInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_request_shape() {
        let args: LoadArgs = serde_json::from_value(json!({
            "select": ["id", "name"],
            "where": { "name": { "_ilike": "%bo%" } },
            "take": -10,
            "orderBy": ["name", "DESC NULLS LAST"],
            "distinctOn": "name",
            "takeCount": true,
            "ctx": { "userId": 1 }
        }))
        .unwrap();

        assert_eq!(args.select, vec!["id", "name"]);
        assert!(args.filter.get("name").is_some());
        assert_eq!(args.take, Some(-10));
        assert_eq!(
            args.order_by,
            vec![("name".to_string(), SortDirection::DescNullsLast)]
        );
        assert_eq!(args.distinct_on, vec!["name"]);
        assert!(args.take_count);
        assert!(!args.take_cursors);
        assert_eq!(args.ctx.get("userId"), Some(&json!(1)));
    }

    #[test]
    fn test_deserialize_order_list_and_nulls() {
        let args: LoadArgs = serde_json::from_value(json!({
            "orderBy": [["name", "ASC"], ["id", "DESC"]],
            "distinctOn": null
        }))
        .unwrap();
        assert_eq!(args.order_by.len(), 2);
        assert!(args.distinct_on.is_empty());
    }

    #[test]
    fn test_page_result_serialization() {
        let page = PageResult {
            nodes: vec![],
            cursors: None,
            page_info: PageInfo {
                has_next_page: true,
                minimum_count: 3,
                ..Default::default()
            },
        };
        assert_eq!(
            serde_json::to_value(&page).unwrap(),
            json!({
                "nodes": [],
                "pageInfo": {
                    "hasPreviousPage": false,
                    "hasNextPage": true,
                    "minimumCount": 3,
                    "count": null
                }
            })
        );
    }
}
