//! Security predicates.
//!
//! Every statement that reads or mutates rows on behalf of a caller embeds one
//! of these fragments. Identity values travel as bound parameters; only column
//! names and operators are part of the SQL text.

use crate::gateway::Value;
use crate::identity::SecurityContext;
use crate::types::{SecurityId, Table};

/// Boolean SQL expression plus its positional parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Fragment {
    /// Creates a fragment.
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Matches every row.
    pub fn always() -> Self {
        Self::new("1 = 1", Vec::new())
    }

    /// Matches no row.
    pub fn never() -> Self {
        Self::new("0 = 1", Vec::new())
    }

    /// Returns true for the [`Fragment::always`] expression.
    pub fn is_always(&self) -> bool {
        self.sql == "1 = 1" && self.params.is_empty()
    }

    /// `column IN (?, ...)`, or [`Fragment::never`] for an empty list.
    pub fn in_list(column: &str, values: impl IntoIterator<Item = Value>) -> Self {
        let params: Vec<Value> = values.into_iter().collect();
        if params.is_empty() {
            return Self::never();
        }
        let placeholders = vec!["?"; params.len()].join(", ");
        Self::new(format!("{column} IN ({placeholders})"), params)
    }

    /// Joins fragments with `AND`. An empty input matches every row.
    pub fn all(parts: impl IntoIterator<Item = Fragment>) -> Self {
        Self::join(parts, " AND ", Self::always)
    }

    /// Joins fragments with `OR`. An empty input matches no row.
    pub fn any(parts: impl IntoIterator<Item = Fragment>) -> Self {
        Self::join(parts, " OR ", Self::never)
    }

    fn join(parts: impl IntoIterator<Item = Fragment>, glue: &str, empty: fn() -> Self) -> Self {
        let mut parts: Vec<Fragment> = parts.into_iter().collect();
        match parts.len() {
            0 => empty(),
            1 => parts.remove(0),
            _ => {
                let mut sql = Vec::with_capacity(parts.len());
                let mut params = Vec::new();
                for part in parts {
                    sql.push(format!("({})", part.sql));
                    params.extend(part.params);
                }
                Self::new(sql.join(glue), params)
            }
        }
    }
}

fn identity_params(context: &SecurityContext) -> Vec<Value> {
    context
        .identities()
        .iter()
        .map(|id| Value::Integer(id.get()))
        .collect()
}

fn write_grants(context: &SecurityContext) -> Vec<Fragment> {
    vec![
        Fragment::new(
            "write_security_id = ? OR write_security_id IS NULL",
            vec![Value::Integer(SecurityId::OPEN.get())],
        ),
        Fragment::in_list("write_security_id", identity_params(context)),
        Fragment::all([
            Fragment::new(
                "write_security_id = ?",
                vec![Value::Integer(SecurityId::SELF_WRITE.get())],
            ),
            Fragment::in_list("id", identity_params(context)),
        ]),
    ]
}

fn exclude_god_row(table: Table, context: &SecurityContext, fragment: Fragment) -> Fragment {
    if table != Table::SecurityNodes {
        return fragment;
    }
    Fragment::all([
        fragment,
        Fragment::new("id <> ?", vec![Value::Integer(context.god_id().get())]),
    ])
}

/// Rows `context` may see.
pub fn build_read(table: Table, context: &SecurityContext) -> Fragment {
    if context.is_god() {
        return Fragment::always();
    }

    let mut grants = vec![Fragment::new(
        "read_security_id = ? OR read_security_id IS NULL",
        vec![Value::Integer(SecurityId::OPEN.get())],
    )];
    if context.is_authenticated() {
        grants.push(Fragment::new(
            "read_security_id = ?",
            vec![Value::Integer(SecurityId::AUTHENTICATED.get())],
        ));
        grants.push(Fragment::in_list("read_security_id", identity_params(context)));
        // Anything writable is readable, including locked rows.
        grants.extend(write_grants(context));
    }

    exclude_god_row(table, context, Fragment::any(grants))
}

/// Rows `context` may modify.
pub fn build_write(table: Table, context: &SecurityContext) -> Fragment {
    if context.is_god() {
        return Fragment::always();
    }
    if !context.is_authenticated() {
        return Fragment::never();
    }
    exclude_god_row(table, context, Fragment::any(write_grants(context)))
}
