use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use ulid::Ulid;

use crate::auth::StaydAuthSource;
use crate::engine::{Engine, EngineError, ListingDraft, Principal};
use crate::model::*;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Login name that maps to the unauthenticated principal.
pub const ANONYMOUS_USER: &str = "anonymous";

pub struct StaydHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<StaydQueryParser>,
}

impl StaydHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(StaydQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    fn resolve_principal<C: ClientInfo>(&self, client: &C) -> Principal {
        match client.metadata().get("user") {
            Some(user) if user != ANONYMOUS_USER => Principal::Named(user.clone()),
            _ => Principal::Anonymous,
        }
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        principal: &Principal,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertProfile {
                id,
                principal: owner,
                role,
                verified,
            } => {
                engine
                    .create_profile(principal, id, owner, role, verified)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateProfile { id, role, verified } => {
                engine
                    .update_profile(principal, id, role, verified)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteProfile { id } => {
                engine
                    .delete_profile(principal, id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertListing {
                id,
                title,
                city,
                price_per_night,
                bedrooms,
                max_guests,
            } => {
                engine
                    .create_listing(
                        principal,
                        id,
                        ListingDraft {
                            title,
                            city,
                            price_per_night,
                            bedrooms,
                            max_guests,
                        },
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateListing { id, patch } => {
                engine
                    .update_listing(principal, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteListing { id } => {
                engine
                    .delete_listing(principal, id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                listing_id,
                start_date,
                end_date,
            } => {
                engine
                    .create_booking(
                        principal,
                        id,
                        listing_id,
                        start_date.as_deref(),
                        end_date.as_deref(),
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateBooking { id, status } => {
                engine
                    .set_booking_status(principal, id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine
                    .cancel_booking(principal, id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertReview {
                id,
                listing_id,
                rating,
                comment,
            } => {
                engine
                    .post_review(principal, id, listing_id, rating, comment)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteReview { id } => {
                engine
                    .delete_review(principal, id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectProfiles { filter } => {
                let profiles = engine
                    .list_profiles(principal, &filter)
                    .map_err(engine_err)?;
                Ok(vec![profiles_response(&profiles)])
            }
            Command::SelectListings { filter } => {
                let listings = if let Some(id) = filter.id {
                    vec![engine
                        .get_listing_info(principal, id)
                        .await
                        .map_err(engine_err)?]
                } else if let Some(host_id) = filter.host_id {
                    engine
                        .profile_listings(principal, host_id)
                        .await
                        .map_err(engine_err)?
                } else {
                    engine
                        .search_listings(principal, &filter)
                        .await
                        .map_err(engine_err)?
                };
                Ok(vec![listings_response(&listings)])
            }
            Command::SelectBookings { filter } => {
                let bookings = engine
                    .list_bookings(principal, &filter)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![bookings_response(&bookings)])
            }
            Command::SelectReviews { listing_id } => {
                let reviews = engine
                    .listing_reviews(principal, listing_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reviews_response(&reviews)])
            }
            Command::SelectAvailability {
                listing_id,
                start_date,
                end_date,
            } => {
                let report = engine
                    .check_availability(listing_id, start_date.as_deref(), end_date.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![availability_response(&report)])
            }
            Command::Listen { channel } => {
                parse_channel(&channel)?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                if let Some(channel) = &channel {
                    parse_channel(channel)?;
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

/// Channels are `listing_<ulid>` or `profile_<ulid>`.
fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id_str = channel
        .strip_prefix("listing_")
        .or_else(|| channel.strip_prefix("profile_"))
        .ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "42000".into(),
                format!("invalid channel: {channel} (expected listing_{{id}} or profile_{{id}})"),
            )))
        })?;
    Ulid::from_string(id_str).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

// ── Row schemas and encoding ─────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn profiles_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("principal", Type::VARCHAR),
        text_field("role", Type::VARCHAR),
        text_field("verified", Type::BOOL),
    ]
}

fn listings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("host_id", Type::VARCHAR),
        text_field("host_principal", Type::VARCHAR),
        text_field("title", Type::VARCHAR),
        text_field("city", Type::VARCHAR),
        text_field("price_per_night", Type::INT8),
        text_field("bedrooms", Type::INT4),
        text_field("max_guests", Type::INT4),
        text_field("status", Type::VARCHAR),
        text_field("rating", Type::FLOAT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("listing_id", Type::VARCHAR),
        text_field("guest_id", Type::VARCHAR),
        text_field("start_date", Type::VARCHAR),
        text_field("end_date", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
    ]
}

fn reviews_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("listing_id", Type::VARCHAR),
        text_field("author_id", Type::VARCHAR),
        text_field("rating", Type::INT4),
        text_field("comment", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("listing_id", Type::VARCHAR),
        text_field("start_date", Type::VARCHAR),
        text_field("end_date", Type::VARCHAR),
        text_field("available", Type::BOOL),
        text_field("conflicting", Type::INT8),
    ]
}

fn profiles_response(profiles: &[ProfileInfo]) -> Response {
    let schema = Arc::new(profiles_schema());
    let rows: Vec<PgWireResult<_>> = profiles
        .iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&p.id.to_string())?;
            encoder.encode_field(&p.principal)?;
            encoder.encode_field(&p.role.as_str())?;
            encoder.encode_field(&p.verified)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn listings_response(listings: &[ListingInfo]) -> Response {
    let schema = Arc::new(listings_schema());
    let rows: Vec<PgWireResult<_>> = listings
        .iter()
        .map(|l| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&l.id.to_string())?;
            encoder.encode_field(&l.host.id.to_string())?;
            encoder.encode_field(&l.host.principal)?;
            encoder.encode_field(&l.title)?;
            encoder.encode_field(&l.city)?;
            encoder.encode_field(&l.price_per_night)?;
            encoder.encode_field(&(l.bedrooms as i32))?;
            encoder.encode_field(&(l.max_guests as i32))?;
            encoder.encode_field(&l.status.as_str())?;
            encoder.encode_field(&l.rating)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn bookings_response(bookings: &[BookingInfo]) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.listing_id.to_string())?;
            encoder.encode_field(&b.guest_id.to_string())?;
            encoder.encode_field(&b.stay.start.to_string())?;
            encoder.encode_field(&b.stay.end.to_string())?;
            encoder.encode_field(&b.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reviews_response(reviews: &[ReviewInfo]) -> Response {
    let schema = Arc::new(reviews_schema());
    let rows: Vec<PgWireResult<_>> = reviews
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.listing_id.to_string())?;
            encoder.encode_field(&r.author_id.to_string())?;
            encoder.encode_field(&(r.rating as i32))?;
            encoder.encode_field(&r.comment)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn availability_response(report: &AvailabilityReport) -> Response {
    let schema = Arc::new(availability_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row: PgWireResult<_> = (|| {
        encoder.encode_field(&report.listing_id.to_string())?;
        encoder.encode_field(&report.stay.start.to_string())?;
        encoder.encode_field(&report.stay.end.to_string())?;
        encoder.encode_field(&report.available)?;
        encoder.encode_field(&(report.conflicting as i64))?;
        Ok(encoder.take_row())
    })();
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

#[async_trait]
impl SimpleQueryHandler for StaydHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let principal = self.resolve_principal(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = crate::observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(&engine, &principal, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(crate::observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaydQueryParser;

#[async_trait]
impl QueryParser for StaydQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema_for(stmt))
    }
}

fn result_schema_for(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("LISTINGS") {
        listings_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("REVIEWS") {
        reviews_schema()
    } else if upper.contains("PROFILES") {
        profiles_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for StaydHandler {
    type Statement = String;
    type QueryParser = StaydQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let principal = self.resolve_principal(client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, &principal, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema_for(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema_for(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StaydFactory {
    handler: Arc<StaydHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StaydAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StaydFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = StaydAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StaydHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaydFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Accept one client connection and serve it until it closes.
pub async fn process_connection(
    socket: tokio::net::TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<pgwire::tokio::TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(StaydFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::Validation(_) => "22023",
        EngineError::Unauthorized(_) => "42501",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        _ => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
