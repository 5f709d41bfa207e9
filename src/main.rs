pub mod auth;
pub mod config;
pub mod course;
pub mod enrollment;
pub mod err;
pub mod form;
pub mod formation;
pub mod io;
pub mod learning;
pub mod ledger;
pub mod mail;
pub mod message;
pub mod models;
pub mod payment;
pub mod receipt;
pub mod reminder;
pub mod submission;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::handler::Handler;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, patch, post};
use axum::{Extension, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::course::CourseLibrary;
use crate::err::{Error, Success};
use crate::io::LocalStore;
use crate::mail::{Mailer, SpoolTransport};

pub type Payload<T> = Result<Success<T>, Error>;
pub type Created<T> = Result<(StatusCode, Success<T>), Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Success::of(value))
}

pub fn created<V>(value: V) -> Created<V>
where
    V: Serialize,
{
    Ok((StatusCode::CREATED, Success::of(value)))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Err(err)
}

/// Shared services handed to every handler next to the database pool.
pub struct Context {
    pub config: Config,
    pub store: LocalStore,
    pub mailer: Mailer,
    pub courses: CourseLibrary,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::load()?;

    let pg = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pg).await?;

    let args: Vec<String> = env::args().skip(1).collect();
    if let Some(command) = args.first() {
        return match command.as_str() {
            "create-admin" => create_admin(&pg, &args[1..]).await,
            other => anyhow::bail!("Unknown command `{}`", other),
        };
    }

    let store = LocalStore::new(&config.storage_dir);
    store.prepare().await?;
    let mailer = Mailer::new(
        Arc::new(SpoolTransport::new(store.clone())),
        config.mail_from.clone(),
        config.admin_email.clone(),
        config.mail_retries,
        Duration::from_secs(config.mail_backoff_secs),
    );
    let addr = config.bind_addr;
    let ctx = Arc::new(Context {
        courses: CourseLibrary::new(&config.courses_dir),
        store,
        mailer,
        config,
    });

    reminder::spawn(pg.clone(), ctx.clone());

    let app = routes().layer(
        ServiceBuilder::new()
            .layer(CorsLayer::permissive())
            .layer(Extension(pg))
            .layer(Extension(ctx)),
    );

    log::info!("Starting TellyTech HTTP Server on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

async fn create_admin(pg: &PgPool, args: &[String]) -> anyhow::Result<()> {
    let (email, password) = match (args.get(0), args.get(1)) {
        (Some(email), Some(password)) => (email, password),
        _ => anyhow::bail!("Usage: create-admin <email> <password> [name]"),
    };
    let name = args.get(2).map(String::as_str).unwrap_or("Administrator");
    if !form::looks_like_email(email) {
        anyhow::bail!("`{}` is not a valid email address", email);
    }
    if auth::create_admin(pg, email, password, name).await? {
        println!("Administrator {} created", email);
    } else {
        println!("An account already exists for {}", email);
    }
    Ok(())
}

fn routes() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route("/uploads/*path", get(uploads))
        // auth
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/verify", get(auth::verify))
        // enrollments
        .route("/api/enrollments", post(enrollment::signup))
        .route("/api/enrollments/admin/pending", get(enrollment::pending))
        .route("/api/enrollments/admin/validated", get(enrollment::validated))
        .route("/api/enrollments/admin/stats", get(enrollment::stats))
        .route("/api/enrollments/admin/:id/validate", post(enrollment::validate))
        .route("/api/enrollments/:id/deactivate", patch(enrollment::deactivate))
        .route("/api/enrollments/:id/reactivate", patch(enrollment::reactivate))
        // payments
        .route("/api/payments/student/dashboard", get(payment::dashboard))
        .route("/api/payments/student/request", post(payment::request))
        .route("/api/payments/receipts/:id", get(payment::download_receipt))
        .route("/api/payments/admin/pending", get(payment::pending))
        .route("/api/payments/admin/validated", get(payment::validated))
        .route("/api/payments/admin/stats", get(payment::stats))
        .route("/api/payments/admin/stats/detailed", get(payment::detailed_stats))
        .route("/api/payments/admin/unpaid", get(payment::unpaid))
        .route("/api/payments/admin/reminders", post(payment::reminders))
        .route("/api/payments/admin/:id/validate", post(payment::validate))
        .route("/api/payments/admin/:id/reject", post(payment::reject))
        // formations
        .route(
            "/api/formations",
            get(formation::list).post(formation::create),
        )
        .route("/api/formations/slug/:slug", get(formation::by_slug))
        .route("/api/formations/category/:category", get(formation::by_category))
        .route(
            "/api/formations/:id",
            get(formation::by_id)
                .put(formation::update)
                .delete(formation::delete),
        )
        // courses
        .route("/api/courses/formations", get(learning::formations))
        .route("/api/courses/my-course", get(learning::my_course))
        .route("/api/courses/my-progress", get(learning::my_progress))
        .route("/api/courses/next-lesson", get(learning::next_lesson))
        .route(
            "/api/courses/modules/:module_id/lessons/:lesson_id",
            get(learning::lesson),
        )
        .route(
            "/api/courses/modules/:module_id/progress",
            get(learning::module_progress),
        )
        .route("/api/courses/:formation/stats", get(learning::course_stats))
        // progress
        .route("/api/progress/my", get(learning::my_submissions))
        .route("/api/progress/parts/:part_id", get(learning::part_access))
        .route("/api/progress/stats", get(learning::global_stats))
        // submissions
        .route(
            "/api/submissions",
            get(submission::list).post(submission::submit),
        )
        .route("/api/submissions/me", get(submission::mine))
        .route("/api/submissions/stats", get(submission::stats))
        .route("/api/submissions/:id/approve", patch(submission::approve))
        .route("/api/submissions/:id/reject", patch(submission::reject))
        // contact messages
        .route("/api/messages", get(message::list).post(message::send))
        .route("/api/messages/stats/overview", get(message::overview))
        .route("/api/messages/bulk-delete", post(message::bulk_delete))
        .route(
            "/api/messages/:id",
            get(message::get).delete(message::delete),
        )
        .route("/api/messages/:id/read", patch(message::mark_read))
        .route("/api/messages/:id/unread", patch(message::mark_unread))
        .fallback(err::handler404.into_service())
}

#[derive(Debug, Clone, Serialize)]
struct Index {
    name: &'static str,
    version: &'static str,
    endpoints: Vec<&'static str>,
}

async fn index() -> Payload<Index> {
    proceeds(Index {
        name: "TellyTech Formation API",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec![
            "/api/auth",
            "/api/enrollments",
            "/api/payments",
            "/api/formations",
            "/api/courses",
            "/api/progress",
            "/api/submissions",
            "/api/messages",
            "/api/health",
        ],
    })
}

#[derive(Debug, Clone, Serialize)]
struct Health {
    status: &'static str,
    database: &'static str,
    timestamp: DateTime<Utc>,
}

async fn health(Extension(pg): Extension<PgPool>) -> Payload<Health> {
    sqlx::query("SELECT 1").execute(&pg).await?;
    proceeds(Health {
        status: "ok",
        database: "up",
        timestamp: Utc::now(),
    })
}

async fn uploads(
    Extension(ctx): Extension<Arc<Context>>,
    Path(path): Path<String>,
) -> Result<(HeaderMap, Vec<u8>), Error> {
    let rel = format!("uploads/{}", path.trim_start_matches('/'));
    if !ctx.store.exists(&rel) {
        return Err(Error::not_found(format!("No such file: {}", path)));
    }
    let bytes = ctx.store.read(&rel).await?;
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(io::content_type_for(&rel)),
    );
    Ok((headers, bytes))
}
