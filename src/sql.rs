use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{BookingFilter, ListingFilter, ListingPatch, ProfileFilter};
use crate::model::{BookingStatus, ListingStatus, Role};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProfile {
        id: Ulid,
        principal: Option<String>,
        role: Role,
        verified: bool,
    },
    UpdateProfile {
        id: Ulid,
        role: Option<Role>,
        verified: Option<bool>,
    },
    DeleteProfile {
        id: Ulid,
    },
    InsertListing {
        id: Ulid,
        title: String,
        city: String,
        price_per_night: i64,
        bedrooms: u32,
        max_guests: u32,
    },
    UpdateListing {
        id: Ulid,
        patch: ListingPatch,
    },
    DeleteListing {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        listing_id: Ulid,
        start_date: Option<String>,
        end_date: Option<String>,
    },
    UpdateBooking {
        id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertReview {
        id: Ulid,
        listing_id: Ulid,
        rating: i64,
        comment: Option<String>,
    },
    DeleteReview {
        id: Ulid,
    },
    SelectProfiles {
        filter: ProfileFilter,
    },
    SelectListings {
        filter: ListingFilter,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectReviews {
        listing_id: Ulid,
    },
    SelectAvailability {
        listing_id: Ulid,
        start_date: Option<String>,
        end_date: Option<String>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN") {
        let rest = trimmed[8..].trim().trim_matches(';').trim();
        let channel = if rest.is_empty() || rest == "*" {
            None
        } else {
            Some(rest.to_string())
        };
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "profiles" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("profiles", 1, 0));
            }
            let id = parse_ulid(&values[0])?;
            let principal = if values.len() >= 2 {
                parse_string_or_null(&values[1])?
            } else {
                None
            };
            let role = if values.len() >= 3 {
                parse_role_or_null(&values[2])?.unwrap_or(Role::Guest)
            } else {
                Role::Guest
            };
            let verified = if values.len() >= 4 {
                parse_bool(&values[3])?
            } else {
                false
            };
            Ok(Command::InsertProfile {
                id,
                principal,
                role,
                verified,
            })
        }
        "listings" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("listings", 6, values.len()));
            }
            Ok(Command::InsertListing {
                id: parse_ulid(&values[0])?,
                title: parse_string(&values[1])?,
                city: parse_string(&values[2])?,
                price_per_night: parse_i64(&values[3])?,
                bedrooms: parse_u32(&values[4])?,
                max_guests: parse_u32(&values[5])?,
            })
        }
        "bookings" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("bookings", 4, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                listing_id: parse_ulid(&values[1])?,
                start_date: parse_string_or_null(&values[2])?,
                end_date: parse_string_or_null(&values[3])?,
            })
        }
        "reviews" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("reviews", 3, values.len()));
            }
            let comment = if values.len() >= 4 {
                parse_string_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::InsertReview {
                id: parse_ulid(&values[0])?,
                listing_id: parse_ulid(&values[1])?,
                rating: parse_i64(&values[2])?,
                comment,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "profiles" => Ok(Command::DeleteProfile { id }),
        "listings" => Ok(Command::DeleteListing { id }),
        // DELETE on a booking cancels it
        "bookings" => Ok(Command::DeleteBooking { id }),
        "reviews" => Ok(Command::DeleteReview { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "profiles" => {
            let mut role = None;
            let mut verified = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "role" => role = Some(parse_role_expr(&a.value)?),
                    "verified" => verified = Some(parse_bool(&a.value)?),
                    col => return Err(SqlError::UnknownColumn("profiles", col.to_string())),
                }
            }
            Ok(Command::UpdateProfile { id, role, verified })
        }
        "listings" => {
            let mut patch = ListingPatch::default();
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "title" => patch.title = Some(parse_string(&a.value)?),
                    "city" => patch.city = Some(parse_string(&a.value)?),
                    "price_per_night" => patch.price_per_night = Some(parse_i64(&a.value)?),
                    "bedrooms" => patch.bedrooms = Some(parse_u32(&a.value)?),
                    "max_guests" => patch.max_guests = Some(parse_u32(&a.value)?),
                    "status" => patch.status = Some(parse_listing_status_expr(&a.value)?),
                    col => return Err(SqlError::UnknownColumn("listings", col.to_string())),
                }
            }
            Ok(Command::UpdateListing { id, patch })
        }
        "bookings" => {
            let mut status = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "status" => status = Some(parse_booking_status_expr(&a.value)?),
                    col => return Err(SqlError::UnknownColumn("bookings", col.to_string())),
                }
            }
            let status = status.ok_or(SqlError::MissingFilter("status"))?;
            Ok(Command::UpdateBooking { id, status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "profiles" => {
            let mut filter = ProfileFilter::default();
            if let Some(selection) = &select.selection {
                extract_profile_filters(selection, &mut filter)?;
            }
            Ok(Command::SelectProfiles { filter })
        }
        "listings" => {
            let mut filter = ListingFilter::default();
            if let Some(selection) = &select.selection {
                extract_listing_filters(selection, &mut filter)?;
            }
            Ok(Command::SelectListings { filter })
        }
        "bookings" => {
            let mut filter = BookingFilter::default();
            if let Some(selection) = &select.selection {
                extract_booking_filters(selection, &mut filter)?;
            }
            Ok(Command::SelectBookings { filter })
        }
        "reviews" => {
            let mut listing_id = None;
            if let Some(selection) = &select.selection {
                extract_review_filters(selection, &mut listing_id)?;
            }
            Ok(Command::SelectReviews {
                listing_id: listing_id.ok_or(SqlError::MissingFilter("listing_id"))?,
            })
        }
        "availability" => {
            let (mut listing_id, mut start_date, mut end_date) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_availability_filters(
                    selection,
                    &mut listing_id,
                    &mut start_date,
                    &mut end_date,
                )?;
            }
            Ok(Command::SelectAvailability {
                listing_id: listing_id.ok_or(SqlError::MissingFilter("listing_id"))?,
                // Missing dates are the engine's validation error, not a parse error
                start_date,
                end_date,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_profile_filters(expr: &Expr, filter: &mut ProfileFilter) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_profile_filters(left, filter)?;
                extract_profile_filters(right, filter)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => filter.id = Some(parse_ulid_expr(right)?),
                Some("principal") => filter.principal = Some(parse_string(right)?),
                Some("role") => filter.role = Some(parse_role_expr(right)?),
                Some("verified") => filter.verified = Some(parse_bool(right)?),
                Some(col) => return Err(SqlError::UnknownColumn("profiles", col.to_string())),
                None => return Err(SqlError::Parse("expected column name".into())),
            },
            _ => return Err(SqlError::Unsupported(format!("operator {op} on profiles"))),
        }
    }
    Ok(())
}

fn extract_listing_filters(expr: &Expr, filter: &mut ListingFilter) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_listing_filters(left, filter)?;
                extract_listing_filters(right, filter)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => filter.id = Some(parse_ulid_expr(right)?),
                Some("host_id") => filter.host_id = Some(parse_ulid_expr(right)?),
                Some("city") => filter.city = Some(parse_string(right)?),
                Some(col) => return Err(SqlError::UnknownColumn("listings", col.to_string())),
                None => return Err(SqlError::Parse("expected column name".into())),
            },
            ast::BinaryOperator::GtEq => match expr_column_name(left).as_deref() {
                Some("price_per_night") => filter.min_price = Some(parse_i64(right)?),
                Some("bedrooms") => filter.min_bedrooms = Some(parse_u32(right)?),
                Some("max_guests") => filter.min_guests = Some(parse_u32(right)?),
                Some(col) => return Err(SqlError::UnknownColumn("listings", col.to_string())),
                None => return Err(SqlError::Parse("expected column name".into())),
            },
            ast::BinaryOperator::LtEq => match expr_column_name(left).as_deref() {
                Some("price_per_night") => filter.max_price = Some(parse_i64(right)?),
                Some(col) => return Err(SqlError::UnknownColumn("listings", col.to_string())),
                None => return Err(SqlError::Parse("expected column name".into())),
            },
            _ => return Err(SqlError::Unsupported(format!("operator {op} on listings"))),
        }
    }
    Ok(())
}

fn extract_booking_filters(expr: &Expr, filter: &mut BookingFilter) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_booking_filters(left, filter)?;
                extract_booking_filters(right, filter)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => filter.id = Some(parse_ulid_expr(right)?),
                Some("listing_id") => filter.listing_id = Some(parse_ulid_expr(right)?),
                Some("guest_id") => filter.guest_id = Some(parse_ulid_expr(right)?),
                Some(col) => return Err(SqlError::UnknownColumn("bookings", col.to_string())),
                None => return Err(SqlError::Parse("expected column name".into())),
            },
            _ => return Err(SqlError::Unsupported(format!("operator {op} on bookings"))),
        }
    }
    Ok(())
}

fn extract_review_filters(expr: &Expr, listing_id: &mut Option<Ulid>) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_review_filters(left, listing_id)?;
                extract_review_filters(right, listing_id)?;
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some("listing_id") {
                    *listing_id = Some(parse_ulid_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_availability_filters(
    expr: &Expr,
    listing_id: &mut Option<Ulid>,
    start_date: &mut Option<String>,
    end_date: &mut Option<String>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_availability_filters(left, listing_id, start_date, end_date)?;
                extract_availability_filters(right, listing_id, start_date, end_date)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("listing_id") => *listing_id = Some(parse_ulid_expr(right)?),
                Some("start_date") => *start_date = Some(parse_string(right)?),
                Some("end_date") => *end_date = Some(parse_string(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_role_expr(expr: &Expr) -> Result<Role, SqlError> {
    let s = parse_string(expr)?;
    Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad role: {s}")))
}

fn parse_role_or_null(expr: &Expr) -> Result<Option<Role>, SqlError> {
    match parse_string_or_null(expr)? {
        None => Ok(None),
        Some(s) => Role::parse(&s)
            .map(Some)
            .ok_or_else(|| SqlError::Parse(format!("bad role: {s}"))),
    }
}

fn parse_listing_status_expr(expr: &Expr) -> Result<ListingStatus, SqlError> {
    let s = parse_string(expr)?;
    ListingStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad listing status: {s}")))
}

fn parse_booking_status_expr(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string(expr)?;
    BookingStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad booking status: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column on {t}: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
