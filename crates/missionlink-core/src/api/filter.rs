//! Table-style query builder for the data API.
//!
//! Filters render to the backend's query string grammar, e.g.
//! `?select=*&user_id=eq.42&order=created_at.desc&limit=20`.

/// A filtered read against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    table: String,
    columns: String,
    predicates: Vec<(String, String)>,
    order: Vec<String>,
    limit: Option<usize>,
}

impl Filter {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: "*".to_string(),
            predicates: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Columns (and embedded relations) to return.
    pub fn select(mut self, columns: &str) -> Self {
        self.columns = columns.to_string();
        self
    }

    pub fn eq(self, column: &str, value: impl ToString) -> Self {
        self.predicate(column, "eq", value)
    }

    pub fn neq(self, column: &str, value: impl ToString) -> Self {
        self.predicate(column, "neq", value)
    }

    pub fn gte(self, column: &str, value: impl ToString) -> Self {
        self.predicate(column, "gte", value)
    }

    pub fn ilike(self, column: &str, pattern: &str) -> Self {
        self.predicate(column, "ilike", pattern)
    }

    fn predicate(mut self, column: &str, op: &str, value: impl ToString) -> Self {
        self.predicates
            .push((column.to_string(), format!("{}.{}", op, value.to_string())));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        let dir = if ascending { "asc" } else { "desc" };
        self.order.push(format!("{}.{}", column, dir));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query pairs for a read (`select`, predicates, `order`, `limit`).
    pub fn read_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.columns.clone())];
        params.extend(self.predicates.iter().cloned());
        if !self.order.is_empty() {
            params.push(("order".to_string(), self.order.join(",")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }

    /// Query pairs for a write; only the predicates select target rows.
    pub fn write_params(&self) -> Vec<(String, String)> {
        self.predicates.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_params() {
        let filter = Filter::table("missions")
            .select("*,association:associations(id,name)")
            .eq("status", "published")
            .ilike("city", "*lyon*")
            .order("start_date", true)
            .order("id", false)
            .limit(20);

        assert_eq!(
            filter.read_params(),
            vec![
                ("select".to_string(), "*,association:associations(id,name)".to_string()),
                ("status".to_string(), "eq.published".to_string()),
                ("city".to_string(), "ilike.*lyon*".to_string()),
                ("order".to_string(), "start_date.asc,id.desc".to_string()),
                ("limit".to_string(), "20".to_string()),
            ]
        );
    }

    #[test]
    fn test_write_params_only_predicates() {
        let filter = Filter::table("notifications")
            .eq("user_id", "u-1")
            .eq("is_read", false)
            .limit(5);
        assert_eq!(
            filter.write_params(),
            vec![
                ("user_id".to_string(), "eq.u-1".to_string()),
                ("is_read".to_string(), "eq.false".to_string()),
            ]
        );
    }
}
