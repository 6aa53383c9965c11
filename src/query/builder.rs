//! Typed SQL builder
//!
//! Every read query is assembled from an explicit representation and
//! rendered to SQL in one place:
//!
//! - [`Expr`]: identifiers from the fixed column tables, function calls,
//!   arithmetic and bound parameters
//! - [`Predicate`]: the filter fragments the engine knows how to emit
//! - [`SelectQuery`]: projections, source, predicates, grouping, totals,
//!   ordering and pagination
//!
//! Caller-supplied values only ever reach the SQL text as `?` placeholders
//! with a matching [`Param`]. The one exception is the row-visibility
//! predicate, which is escaped by the selector translator and has the
//! binder's placeholder character doubled when spliced.

use crate::columns::Dimension;
use crate::selector::RowFilter;
use crate::store::{escape_placeholders, BoundQuery, Param};
use crate::types::TimeRange;

// ============================================================================
// Writer
// ============================================================================

/// Accumulates SQL text and parameters in placeholder order
#[derive(Debug, Default)]
struct SqlWriter {
    sql: String,
    params: Vec<Param>,
}

impl SqlWriter {
    fn text(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn param(&mut self, p: Param) {
        self.sql.push('?');
        self.params.push(p);
    }

    fn finish(self) -> BoundQuery {
        BoundQuery::new(self.sql, self.params)
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// SQL expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column name or alias taken from the fixed tables
    Ident(String),
    /// Static SQL token such as `NaN` or `0`
    Keyword(&'static str),
    /// Bound value
    Param(Param),
    /// Function call
    Func(&'static str, Vec<Expr>),
    /// `count(DISTINCT expr)`
    CountDistinct(Box<Expr>),
    /// Infix operator
    Binary(Box<Expr>, &'static str, Box<Expr>),
    /// `if(cond, then, else)`
    If(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Column or alias
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Ident(name.into())
    }

    /// Function call
    pub fn func(name: &'static str, args: Vec<Expr>) -> Self {
        Expr::Func(name, args)
    }

    /// `SUM(expr)`
    pub fn sum(expr: Expr) -> Self {
        Expr::func("SUM", vec![expr])
    }

    /// Bound parameter
    pub fn param(p: Param) -> Self {
        Expr::Param(p)
    }

    /// `self / rhs`
    pub fn div(self, rhs: Expr) -> Self {
        Expr::Binary(Box::new(self), "/", Box::new(rhs))
    }

    /// `self - rhs`
    pub fn sub(self, rhs: Expr) -> Self {
        Expr::Binary(Box::new(self), "-", Box::new(rhs))
    }

    /// `self * rhs`
    pub fn mul(self, rhs: Expr) -> Self {
        Expr::Binary(Box::new(self), "*", Box::new(rhs))
    }

    /// `self == rhs`
    pub fn eq(self, rhs: Expr) -> Self {
        Expr::Binary(Box::new(self), "==", Box::new(rhs))
    }

    /// Operand of an infix operator; nested infix expressions are grouped
    fn render_operand(&self, w: &mut SqlWriter) {
        if let Expr::Binary(..) = self {
            w.text("(");
            self.render(w);
            w.text(")");
        } else {
            self.render(w);
        }
    }

    fn render(&self, w: &mut SqlWriter) {
        match self {
            Expr::Ident(name) => w.text(name),
            Expr::Keyword(kw) => w.text(kw),
            Expr::Param(p) => w.param(p.clone()),
            Expr::Func(name, args) => {
                w.text(name);
                w.text("(");
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        w.text(", ");
                    }
                    arg.render(w);
                }
                w.text(")");
            }
            Expr::CountDistinct(inner) => {
                w.text("count(DISTINCT ");
                inner.render(w);
                w.text(")");
            }
            Expr::Binary(lhs, op, rhs) => {
                lhs.render_operand(w);
                w.text(" ");
                w.text(op);
                w.text(" ");
                rhs.render_operand(w);
            }
            Expr::If(cond, then, otherwise) => {
                w.text("if(");
                cond.render(w);
                w.text(", ");
                then.render(w);
                w.text(", ");
                otherwise.render(w);
                w.text(")");
            }
        }
    }
}

// ============================================================================
// Predicates
// ============================================================================

/// Label filter: the label `key` must hold one of `values`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    /// Label key
    pub key: String,
    /// Accepted values
    pub values: Vec<String>,
}

/// WHERE clause fragment
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `period_start >= from AND period_start <= to`
    PeriodBetween(TimeRange),
    /// `column = value`
    Eq(&'static str, Param),
    /// `column IN (v1, v2, ...)`
    In(Dimension, Vec<String>),
    /// Conjunction of `has([values], labels.value[indexOf(labels.key, key)])`
    Labels(Vec<LabelFilter>),
    /// `(lowerUTF8(c1) LIKE pattern OR lowerUTF8(c2) LIKE pattern ...)`
    Search(Vec<&'static str>, String),
    /// Row-visibility predicate from the selector translator
    RowFilter(RowFilter),
}

impl Predicate {
    /// False for fragments that would restrict nothing and render nothing
    fn is_effective(&self) -> bool {
        match self {
            Predicate::In(_, values) => !values.is_empty(),
            Predicate::Labels(filters) => !filters.is_empty(),
            Predicate::Search(columns, _) => !columns.is_empty(),
            _ => true,
        }
    }

    fn render(&self, w: &mut SqlWriter) {
        match self {
            Predicate::PeriodBetween(range) => {
                w.text("period_start >= ");
                w.param(Param::Int(range.from));
                w.text(" AND period_start <= ");
                w.param(Param::Int(range.to));
            }
            Predicate::Eq(column, value) => {
                w.text(column);
                w.text(" = ");
                w.param(value.clone());
            }
            Predicate::In(dim, values) => {
                w.text(dim.column());
                w.text(" IN (");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        w.text(", ");
                    }
                    w.param(Param::Str(v.clone()));
                }
                w.text(")");
            }
            Predicate::Labels(filters) => {
                w.text("(");
                for (i, f) in filters.iter().enumerate() {
                    if i > 0 {
                        w.text(" AND ");
                    }
                    w.text("has(");
                    w.param(Param::StrList(f.values.clone()));
                    w.text(", labels.value[indexOf(labels.key, ");
                    w.param(Param::Str(f.key.clone()));
                    w.text(")])");
                }
                w.text(")");
            }
            Predicate::Search(columns, pattern) => {
                w.text("(");
                for (i, c) in columns.iter().enumerate() {
                    if i > 0 {
                        w.text(" OR ");
                    }
                    w.text("lowerUTF8(");
                    w.text(c);
                    w.text(") LIKE ");
                    w.param(Param::Str(pattern.clone()));
                }
                w.text(")");
            }
            Predicate::RowFilter(filter) => {
                w.text("(");
                w.text(&escape_placeholders(filter.as_str()));
                w.text(")");
            }
        }
    }
}

// ============================================================================
// Select
// ============================================================================

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

impl Direction {
    fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// Row source of a select
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Named table
    Table(&'static str),
    /// `(q1 UNION ALL q2 ...)`
    UnionAll(Vec<SelectQuery>),
}

/// Select statement
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    distinct: bool,
    projections: Vec<(Expr, Option<String>)>,
    source: Source,
    array_join: Option<&'static str>,
    predicates: Vec<Predicate>,
    group_by: Vec<Expr>,
    with_totals: bool,
    order_by: Vec<(Expr, Direction)>,
    limit: Option<(u64, u64)>,
}

impl SelectQuery {
    /// Select from a table
    pub fn from_table(table: &'static str) -> Self {
        Self::from_source(Source::Table(table))
    }

    /// Select from a source
    pub fn from_source(source: Source) -> Self {
        Self {
            distinct: false,
            projections: Vec::new(),
            source,
            array_join: None,
            predicates: Vec::new(),
            group_by: Vec::new(),
            with_totals: false,
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// `SELECT DISTINCT`
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Add `expr AS alias`
    pub fn project(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.projections.push((expr, Some(alias.into())));
        self
    }

    /// Add a projection without alias
    pub fn project_bare(mut self, expr: Expr) -> Self {
        self.projections.push((expr, None));
        self
    }

    /// Add several aliased projections
    pub fn project_all(mut self, items: impl IntoIterator<Item = (Expr, String)>) -> Self {
        self.projections
            .extend(items.into_iter().map(|(e, a)| (e, Some(a))));
        self
    }

    /// `LEFT ARRAY JOIN column`
    pub fn left_array_join(mut self, column: &'static str) -> Self {
        self.array_join = Some(column);
        self
    }

    /// Add a WHERE fragment
    pub fn filter(mut self, predicate: Predicate) -> Self {
        if predicate.is_effective() {
            self.predicates.push(predicate);
        }
        self
    }

    /// Add several WHERE fragments
    pub fn filter_all(mut self, predicates: impl IntoIterator<Item = Predicate>) -> Self {
        for p in predicates {
            self = self.filter(p);
        }
        self
    }

    /// Add a GROUP BY key
    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    /// Append the `WITH TOTALS` grand-total row
    pub fn with_totals(mut self) -> Self {
        self.with_totals = true;
        self
    }

    /// Add an ORDER BY key
    pub fn order_by(mut self, expr: Expr, direction: Direction) -> Self {
        self.order_by.push((expr, direction));
        self
    }

    /// `LIMIT offset, count`
    pub fn limit(mut self, offset: u64, count: u64) -> Self {
        self.limit = Some((offset, count));
        self
    }

    /// Render to SQL and parameters
    pub fn render(&self) -> BoundQuery {
        let mut w = SqlWriter::default();
        self.render_into(&mut w);
        w.finish()
    }

    fn render_into(&self, w: &mut SqlWriter) {
        w.text(if self.distinct { "SELECT DISTINCT " } else { "SELECT " });
        for (i, (expr, alias)) in self.projections.iter().enumerate() {
            if i > 0 {
                w.text(", ");
            }
            expr.render(w);
            if let Some(alias) = alias {
                w.text(" AS ");
                w.text(alias);
            }
        }

        w.text(" FROM ");
        match &self.source {
            Source::Table(table) => w.text(table),
            Source::UnionAll(queries) => {
                w.text("(");
                for (i, q) in queries.iter().enumerate() {
                    if i > 0 {
                        w.text(" UNION ALL ");
                    }
                    q.render_into(w);
                }
                w.text(")");
            }
        }

        if let Some(column) = self.array_join {
            w.text(" LEFT ARRAY JOIN ");
            w.text(column);
        }

        if !self.predicates.is_empty() {
            w.text(" WHERE ");
            for (i, p) in self.predicates.iter().enumerate() {
                if i > 0 {
                    w.text(" AND ");
                }
                p.render(w);
            }
        }

        if !self.group_by.is_empty() {
            w.text(" GROUP BY ");
            for (i, g) in self.group_by.iter().enumerate() {
                if i > 0 {
                    w.text(", ");
                }
                g.render(w);
            }
            if self.with_totals {
                w.text(" WITH TOTALS");
            }
        }

        if !self.order_by.is_empty() {
            w.text(" ORDER BY ");
            for (i, (expr, dir)) in self.order_by.iter().enumerate() {
                if i > 0 {
                    w.text(", ");
                }
                expr.render(w);
                w.text(" ");
                w.text(dir.as_sql());
            }
        }

        if let Some((offset, count)) = self.limit {
            w.text(" LIMIT ");
            w.param(Param::UInt(offset));
            w.text(", ");
            w.param(Param::UInt(count));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;

    fn range() -> TimeRange {
        TimeRange::new(100, 200).unwrap()
    }

    #[test]
    fn test_render_grouped_with_totals() {
        let q = SelectQuery::from_table("metrics")
            .project(Expr::col("queryid"), "dimension")
            .project(Expr::sum(Expr::col("num_queries")), "num_queries")
            .filter(Predicate::PeriodBetween(range()))
            .group_by(Expr::col("queryid"))
            .with_totals()
            .order_by(Expr::col("num_queries"), Direction::Desc)
            .limit(0, 10)
            .render();

        assert_eq!(
            q.sql(),
            "SELECT queryid AS dimension, SUM(num_queries) AS num_queries FROM metrics \
             WHERE period_start >= ? AND period_start <= ? \
             GROUP BY queryid WITH TOTALS ORDER BY num_queries DESC LIMIT ?, ?"
        );
        assert_eq!(
            q.params(),
            &[
                Param::Int(100),
                Param::Int(200),
                Param::UInt(0),
                Param::UInt(10)
            ]
        );
    }

    #[test]
    fn test_values_are_bound_not_spliced() {
        let q = SelectQuery::from_table("metrics")
            .project_bare(Expr::col("queryid"))
            .filter(Predicate::In(
                Dimension::ServiceName,
                vec!["a'b".to_string(), "c:d".to_string()],
            ))
            .filter(Predicate::Labels(vec![LabelFilter {
                key: "team".to_string(),
                values: vec!["x".to_string()],
            }]))
            .render();

        assert_eq!(
            q.sql(),
            "SELECT queryid FROM metrics WHERE service_name IN (?, ?) \
             AND (has(?, labels.value[indexOf(labels.key, ?)]))"
        );
        assert!(!q.sql().contains("a'b"));
        assert_eq!(q.params()[1], Param::Str("c:d".to_string()));
        assert_eq!(q.params()[2], Param::StrList(vec!["x".to_string()]));
    }

    #[test]
    fn test_empty_filters_are_dropped() {
        let q = SelectQuery::from_table("metrics")
            .project_bare(Expr::col("queryid"))
            .filter(Predicate::In(Dimension::Database, vec![]))
            .filter(Predicate::Labels(vec![]))
            .render();
        assert_eq!(q.sql(), "SELECT queryid FROM metrics");
    }

    #[test]
    fn test_row_filter_placeholder_escaped() {
        let filter = Selector::parse_all(&[r#"{service_name=~"colou?r"}"#])
            .unwrap()
            .to_sql()
            .unwrap();
        let q = SelectQuery::from_table("metrics")
            .project_bare(Expr::col("queryid"))
            .filter(Predicate::RowFilter(filter))
            .render();
        assert_eq!(
            q.sql(),
            "SELECT queryid FROM metrics WHERE (match(service_name, 'colou??r'))"
        );
        assert!(q.params().is_empty());
    }

    #[test]
    fn test_union_all_params_in_order() {
        let inner = |v: i64| {
            SelectQuery::from_table("metrics")
                .project(Expr::param(Param::Int(v)), "x")
        };
        let q = SelectQuery::from_source(Source::UnionAll(vec![inner(1), inner(2)]))
            .project(Expr::func("sum", vec![Expr::col("x")]), "x")
            .render();
        assert_eq!(
            q.sql(),
            "SELECT sum(x) AS x FROM (SELECT ? AS x FROM metrics UNION ALL SELECT ? AS x FROM metrics)"
        );
        assert_eq!(q.params(), &[Param::Int(1), Param::Int(2)]);
    }

    #[test]
    fn test_if_and_arithmetic() {
        let expr = Expr::If(
            Box::new(Expr::sum(Expr::col("m_query_time_cnt")).eq(Expr::Keyword("0"))),
            Box::new(Expr::Keyword("NaN")),
            Box::new(Expr::sum(Expr::col("m_query_time_sum")).div(Expr::col("time_frame"))),
        );
        let q = SelectQuery::from_table("metrics").project(expr, "v").render();
        assert_eq!(
            q.sql(),
            "SELECT if(SUM(m_query_time_cnt) == 0, NaN, SUM(m_query_time_sum) / time_frame) AS v FROM metrics"
        );
    }

    #[test]
    fn test_nested_arithmetic_is_parenthesized() {
        // (a - b) / (c * d), rendered without grouping, would divide b alone
        let expr = Expr::col("a")
            .sub(Expr::col("b"))
            .div(Expr::col("c").mul(Expr::param(Param::Int(2))));
        let q = SelectQuery::from_table("metrics").project(expr, "v").render();
        assert_eq!(q.sql(), "SELECT (a - b) / (c * ?) AS v FROM metrics");
        assert_eq!(q.params(), &[Param::Int(2)]);

        let flat = Expr::col("a").div(Expr::sum(Expr::col("b").mul(Expr::col("c"))));
        let q = SelectQuery::from_table("metrics").project(flat, "v").render();
        assert_eq!(q.sql(), "SELECT a / SUM(b * c) AS v FROM metrics");
    }

    #[test]
    fn test_search_predicate() {
        let q = SelectQuery::from_table("metrics")
            .project_bare(Expr::col("queryid"))
            .filter(Predicate::Search(
                vec!["queryid", "fingerprint"],
                "%select%".to_string(),
            ))
            .render();
        assert_eq!(
            q.sql(),
            "SELECT queryid FROM metrics WHERE (lowerUTF8(queryid) LIKE ? OR lowerUTF8(fingerprint) LIKE ?)"
        );
        assert_eq!(q.params().len(), 2);
    }
}
