// ABOUTME: SQL dialect rules for the batch query: identifier quoting, placeholders, limits
// ABOUTME: Qualified names are split, stripped of existing quoting, and re-quoted per segment

use crate::schema::resolver::NAMESPACE_SEPARATOR;
use serde::{Deserialize, Serialize};

/// Target engine for generated batch queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    Postgres,
    Sqlite,
    SqlServer,
}

/// Parameter kind, used where an engine needs an explicit cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Integer,
    Bytes,
}

impl SqlDialect {
    /// Quote a possibly namespace-qualified identifier.
    ///
    /// Each `.`-separated segment is trimmed of whitespace and of any quoting
    /// already present, then quoted for this dialect with embedded quote
    /// characters escaped.
    pub fn quote_identifier(&self, name: &str) -> String {
        name.split(NAMESPACE_SEPARATOR)
            .map(|segment| self.quote_segment(strip_quoting(segment)))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn quote_segment(&self, segment: &str) -> String {
        let (open, close) = match self {
            SqlDialect::Postgres | SqlDialect::Sqlite => ('"', '"'),
            SqlDialect::SqlServer => ('[', ']'),
        };
        let mut quoted = String::with_capacity(segment.len() + 2);
        quoted.push(open);
        for ch in segment.chars() {
            if ch == close {
                quoted.push(close);
            }
            quoted.push(ch);
        }
        quoted.push(close);
        quoted
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize, kind: ParamKind) -> String {
        match self {
            SqlDialect::Postgres => match kind {
                ParamKind::Integer => format!("${}::bigint", index),
                ParamKind::Bytes => format!("${}::bytea", index),
            },
            SqlDialect::Sqlite => format!("?{}", index),
            SqlDialect::SqlServer => format!("@p{}", index),
        }
    }

    /// Render `SELECT ... WHERE w <op> :since ORDER BY w ASC` with a row limit.
    ///
    /// Parameter 1 is the watermark, parameter 2 the batch size.
    pub(crate) fn batch_query(
        &self,
        columns: &[String],
        table: &str,
        watermark_column: &str,
        comparison: &str,
        since_kind: ParamKind,
    ) -> String {
        let column_list = columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let table = self.quote_identifier(table);
        let watermark = self.quote_identifier(watermark_column);
        let since = self.placeholder(1, since_kind);
        let limit = self.placeholder(2, ParamKind::Integer);

        match self {
            SqlDialect::SqlServer => format!(
                "SELECT TOP ({}) {} FROM {} WHERE {} {} {} ORDER BY {} ASC",
                limit, column_list, table, watermark, comparison, since, watermark
            ),
            SqlDialect::Postgres | SqlDialect::Sqlite => format!(
                "SELECT {} FROM {} WHERE {} {} {} ORDER BY {} ASC LIMIT {}",
                column_list, table, watermark, comparison, since, watermark, limit
            ),
        }
    }
}

/// Remove surrounding whitespace and any quote characters a caller already
/// applied (`"name"`, `[name]`, `` `name` ``).
fn strip_quoting(segment: &str) -> &str {
    segment.trim_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '[' | ']' | '`'))
}
