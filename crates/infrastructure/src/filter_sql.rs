//! Translation of parsed filter expressions into SQL predicates. Column
//! references go through an explicit whitelist per endpoint; anything not
//! listed is rejected before touching the query.

use sqlx::{Postgres, QueryBuilder};

use sner_core::errors::{SnerError, SnerResult};
use sner_core::filter::{Criterion, Filter, FilterOp, Value};

/// Whitelist mapping `Model.field` colspecs to SQL expressions.
pub struct ColumnMap {
    columns: Vec<((&'static str, &'static str), &'static str)>,
}

impl ColumnMap {
    pub fn new(columns: Vec<((&'static str, &'static str), &'static str)>) -> Self {
        Self { columns }
    }

    fn get(&self, model: &str, field: &str) -> Option<&'static str> {
        self.columns
            .iter()
            .find(|((m, f), _)| *m == model && *f == field)
            .map(|(_, column)| *column)
    }
}

/// Append the filter as a parenthesised SQL predicate with bound values.
pub fn push_filter(
    builder: &mut QueryBuilder<'_, Postgres>,
    filter: &Filter,
    columns: &ColumnMap,
) -> SnerResult<()> {
    match filter {
        Filter::Or(items) => push_group(builder, items, " OR ", columns),
        Filter::And(items) => push_group(builder, items, " AND ", columns),
        Filter::Criterion(criterion) => push_criterion(builder, criterion, columns),
    }
}

fn push_group(
    builder: &mut QueryBuilder<'_, Postgres>,
    items: &[Filter],
    separator: &str,
    columns: &ColumnMap,
) -> SnerResult<()> {
    builder.push("(");
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            builder.push(separator);
        }
        push_filter(builder, item, columns)?;
    }
    builder.push(")");
    Ok(())
}

fn push_criterion(
    builder: &mut QueryBuilder<'_, Postgres>,
    criterion: &Criterion,
    columns: &ColumnMap,
) -> SnerResult<()> {
    let column = columns
        .get(&criterion.model, &criterion.field)
        .ok_or_else(|| {
            SnerError::BadRequest(format!(
                "unknown filter column {}.{}",
                criterion.model, criterion.field
            ))
        })?;

    match criterion.op {
        FilterOp::Eq | FilterOp::Gt | FilterOp::Lt | FilterOp::Ge | FilterOp::Le => {
            let operator = match criterion.op {
                FilterOp::Eq => " = ",
                FilterOp::Gt => " > ",
                FilterOp::Lt => " < ",
                FilterOp::Ge => " >= ",
                FilterOp::Le => " <= ",
                _ => unreachable!(),
            };
            match &criterion.value {
                Value::String(value) => {
                    builder.push(column).push(operator).push_bind(value.clone());
                }
                Value::Number(value) => {
                    builder
                        .push(format!("{column}::float8"))
                        .push(operator)
                        .push_bind(*value);
                }
                Value::Array(_) => {
                    return Err(scalar_expected(criterion));
                }
            }
        }
        FilterOp::Ne => match &criterion.value {
            Value::String(value) => {
                builder
                    .push(column)
                    .push(" IS DISTINCT FROM ")
                    .push_bind(value.clone());
            }
            Value::Number(value) => {
                builder
                    .push(format!("{column}::float8"))
                    .push(" IS DISTINCT FROM ")
                    .push_bind(*value);
            }
            Value::Array(_) => return Err(scalar_expected(criterion)),
        },
        FilterOp::Ilike | FilterOp::NotIlike | FilterOp::AstextIlike | FilterOp::AstextNotIlike => {
            let Value::String(pattern) = &criterion.value else {
                return Err(scalar_expected(criterion));
            };
            let (expr, operator) = match criterion.op {
                FilterOp::Ilike => (column.to_string(), " ILIKE "),
                FilterOp::NotIlike => (column.to_string(), " NOT ILIKE "),
                FilterOp::AstextIlike => (format!("{column}::text"), " ILIKE "),
                FilterOp::AstextNotIlike => (format!("{column}::text"), " NOT ILIKE "),
                _ => unreachable!(),
            };
            builder.push(expr).push(operator).push_bind(pattern.clone());
        }
        FilterOp::IsNull => {
            builder.push(column).push(" IS NULL");
        }
        FilterOp::IsNotNull => {
            builder.push(column).push(" IS NOT NULL");
        }
        FilterOp::In | FilterOp::NotIn => {
            let values = array_of_text(criterion)?;
            let expr = match criterion.op {
                FilterOp::In => " = ANY(",
                _ => " != ALL(",
            };
            builder
                .push(format!("{column}::text"))
                .push(expr)
                .push_bind(values)
                .push(")");
        }
        FilterOp::Any | FilterOp::NotAny => {
            let Value::String(value) = &criterion.value else {
                return Err(scalar_expected(criterion));
            };
            if criterion.op == FilterOp::NotAny {
                builder.push("NOT (");
            }
            builder
                .push_bind(value.clone())
                .push(format!(" = ANY({column})"));
            if criterion.op == FilterOp::NotAny {
                builder.push(")");
            }
        }
        FilterOp::InetIn | FilterOp::InetNotIn => {
            let Value::String(network) = &criterion.value else {
                return Err(scalar_expected(criterion));
            };
            if criterion.op == FilterOp::InetNotIn {
                builder.push("NOT (");
            }
            builder
                .push(format!("{column}::inet <<= "))
                .push_bind(network.clone())
                .push("::inet");
            if criterion.op == FilterOp::InetNotIn {
                builder.push(")");
            }
        }
    }
    Ok(())
}

fn scalar_expected(criterion: &Criterion) -> SnerError {
    SnerError::BadRequest(format!(
        "operator {} expects a scalar value for {}.{}",
        criterion.op.as_str(),
        criterion.model,
        criterion.field
    ))
}

fn array_of_text(criterion: &Criterion) -> SnerResult<Vec<String>> {
    let Value::Array(items) = &criterion.value else {
        return Err(SnerError::BadRequest(format!(
            "operator {} expects an array for {}.{}",
            criterion.op.as_str(),
            criterion.model,
            criterion.field
        )));
    };
    Ok(items
        .iter()
        .map(|item| match item {
            Value::String(value) => value.clone(),
            Value::Number(value) => {
                if value.fract() == 0.0 {
                    format!("{}", *value as i64)
                } else {
                    value.to_string()
                }
            }
            Value::Array(_) => String::new(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sner_core::filter::parse;

    fn columns() -> ColumnMap {
        ColumnMap::new(vec![
            (("Host", "address"), "host.address"),
            (("Host", "tags"), "host.tags"),
            (("Service", "port"), "service.port"),
            (("Service", "state"), "service.state"),
        ])
    }

    fn render(input: &str) -> SnerResult<String> {
        let filter = parse(input)?;
        let mut builder = QueryBuilder::new("");
        push_filter(&mut builder, &filter, &columns())?;
        Ok(builder.sql().to_string())
    }

    #[test]
    fn renders_boolean_structure() {
        let sql = render(r#"Host.address=="10.0.0.1" AND Service.state ilike "open:%""#).unwrap();
        assert_eq!(sql, "(host.address = $1 AND service.state ILIKE $2)");

        let sql = render(r#"Host.address=="a" OR Host.address=="b" AND Service.port==22"#).unwrap();
        assert_eq!(
            sql,
            "(host.address = $1 OR (host.address = $2 AND service.port::float8 = $3))"
        );
    }

    #[test]
    fn renders_array_and_null_ops() {
        assert_eq!(
            render(r#"Host.tags not_any "reviewed""#).unwrap(),
            "NOT ($1 = ANY(host.tags))"
        );
        assert_eq!(
            render(r#"Service.port in [80, 443]"#).unwrap(),
            "service.port::text = ANY($1)"
        );
        assert_eq!(
            render(r#"Service.state is_null """#).unwrap(),
            "service.state IS NULL"
        );
        assert_eq!(
            render(r#"Host.address inet_in "10.0.0.0/24""#).unwrap(),
            "host.address::inet <<= $1::inet"
        );
    }

    #[test]
    fn rejects_unknown_columns() {
        assert!(matches!(
            render(r#"Vuln.name=="x""#),
            Err(SnerError::BadRequest(_))
        ));
        assert!(matches!(
            render(r#"Host.secret=="x""#),
            Err(SnerError::BadRequest(_))
        ));
    }
}
