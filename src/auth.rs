use std::ops::Add;
use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequest, RequestParts};
use axum::headers::authorization::Bearer;
use axum::headers::Authorization;
use axum::{Extension, TypedHeader};
use chrono::{DateTime, Duration, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::form::JsonBody;
use crate::models::{Enrollment, Role, UserAccount, UserSession};
use crate::{breaks, proceeds, Context, Error, Payload};

/// An authenticated bearer token and the account behind it.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user: UserAccount,
    pub enrollment: Option<Enrollment>,
}

/// A session whose account has the ADMIN role.
#[derive(Debug, Clone)]
pub struct Admin(pub Session);

/// A session whose account is a student with an active enrollment.
#[derive(Debug, Clone)]
pub struct Student {
    pub user: UserAccount,
    pub enrollment: Enrollment,
}

#[async_trait]
impl<B: Send> FromRequest<B> for Session {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request(req)
                .await
                .map_err(|_| Error::unauthorized("Missing bearer token"))?;
        let Extension(pg) = Extension::<PgPool>::from_request(req)
            .await
            .map_err(|err| Error::InternalError {
                kind: "ExtensionError",
                message: err.to_string(),
            })?;
        ensure_authenticated(bearer.token(), &pg).await
    }
}

#[async_trait]
impl<B: Send> FromRequest<B> for Admin {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let session = Session::from_request(req).await?;
        if session.user.role != Role::Admin {
            return Err(Error::forbidden("Administrator access required"));
        }
        Ok(Admin(session))
    }
}

#[async_trait]
impl<B: Send> FromRequest<B> for Student {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let session = Session::from_request(req).await?;
        student_of(session)
    }
}

fn student_of(session: Session) -> Result<Student, Error> {
    if session.user.role != Role::Student {
        return Err(Error::forbidden("Student access required"));
    }
    let enrollment = session
        .enrollment
        .ok_or_else(|| Error::not_found("No enrollment is linked to this account"))?;
    if !enrollment.active {
        return Err(Error::forbidden("This enrollment is inactive"));
    }
    Ok(Student {
        user: session.user,
        enrollment,
    })
}

pub async fn ensure_authenticated(token: &str, pg: &PgPool) -> Result<Session, Error> {
    if token.is_empty() {
        return Err(Error::unauthorized("Empty bearer token"));
    }
    let session = sqlx::query_as::<_, UserSession>(
        "SELECT * FROM user_sessions WHERE token = $1 LIMIT 1",
    )
    .bind(token)
    .fetch_optional(pg)
    .await?
    .ok_or_else(|| Error::unauthorized("Invalid session"))?;

    if Utc::now().gt(&session.expires_at) {
        sqlx::query("DELETE FROM user_sessions WHERE token = $1")
            .bind(token)
            .execute(pg)
            .await?;
        return Err(Error::unauthorized("Session expired"));
    }

    let user = sqlx::query_as::<_, UserAccount>("SELECT * FROM users WHERE id = $1 LIMIT 1")
        .bind(session.user_id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::unauthorized("Account no longer exists"))?;

    let enrollment = match user.role {
        Role::Student => enrollment_for(&user.email, pg).await?,
        Role::Admin => None,
    };

    Ok(Session {
        token: token.to_string(),
        user,
        enrollment,
    })
}

async fn enrollment_for(email: &str, pg: &PgPool) -> Result<Option<Enrollment>, Error> {
    Ok(
        sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollments WHERE email = $1 LIMIT 1")
            .bind(email)
            .fetch_optional(pg)
            .await?,
    )
}

pub fn hash_password(password: &str) -> Result<String, Error> {
    Ok(Pbkdf2
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, Error> {
    let hash = PasswordHash::new(hash)?;
    Ok(Pbkdf2.verify_password(password.as_bytes(), &hash).is_ok())
}

/// Hex SHA-256 of 32 random bytes.
pub fn new_token() -> String {
    let bytes: [u8; 32] = thread_rng().gen();
    let mut hasher: Sha256 = Digest::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

const PURGE_EXPIRED_SESSIONS: &str =
    "DELETE FROM user_sessions WHERE user_id = $1 AND expires_at <= NOW()";

pub async fn login(
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    JsonBody(login): JsonBody<LoginRequest>,
) -> Payload<LoggedIn> {
    let email = login.email.trim().to_lowercase();
    if email.is_empty() || login.password.is_empty() {
        return breaks(Error::invalid("`email` and `password` are required"));
    }

    let user = sqlx::query_as::<_, UserAccount>("SELECT * FROM users WHERE email = $1 LIMIT 1")
        .bind(&email)
        .fetch_optional(&pg)
        .await?;
    let user = match user {
        Some(user) => user,
        None => return breaks(Error::unauthorized("Invalid email or password")),
    };
    if !verify_password(&login.password, &user.password_hash)? {
        return breaks(Error::unauthorized("Invalid email or password"));
    }

    let enrollment = match user.role {
        Role::Student => {
            let enrollment = enrollment_for(&user.email, &pg).await?;
            match &enrollment {
                Some(e) if !e.active => {
                    return breaks(Error::forbidden("This enrollment is inactive"))
                }
                None => log::warn!("Student account {} has no enrollment", user.email),
                _ => {}
            }
            enrollment
        }
        Role::Admin => None,
    };

    let purged = sqlx::query(PURGE_EXPIRED_SESSIONS)
        .bind(user.id)
        .execute(&pg)
        .await?;
    if purged.rows_affected() > 0 {
        log::debug!("Dropped {} expired sessions of {}", purged.rows_affected(), user.email);
    }

    let token = new_token();
    let expires_at = Utc::now().add(Duration::days(ctx.config.session_days));
    let res = sqlx::query("INSERT INTO user_sessions (token, user_id, expires_at) VALUES ($1, $2, $3)")
        .bind(&token)
        .bind(user.id)
        .bind(expires_at)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::InternalError {
            kind: "DatabaseError",
            message: "Could not store session".to_string(),
        });
    }

    log::info!("Login: {} ({:?})", user.email, user.role);
    proceeds(LoggedIn {
        token,
        expires_at,
        user: Profile::of(&user, enrollment.as_ref()),
    })
}

pub async fn logout(session: Session, Extension(pg): Extension<PgPool>) -> Payload<LoggedOut> {
    let affected = sqlx::query("DELETE FROM user_sessions WHERE token = $1")
        .bind(&session.token)
        .execute(&pg)
        .await?;
    proceeds(LoggedOut {
        user_id: session.user.id,
        logged_out: affected.rows_affected() >= 1,
    })
}

pub async fn verify(session: Session) -> Payload<VerifiedSession> {
    proceeds(VerifiedSession {
        user: Profile::of(&session.user, session.enrollment.as_ref()),
    })
}

/// Creates an administrator account. Returns `false` when the email is taken.
pub async fn create_admin(pg: &PgPool, email: &str, password: &str, name: &str) -> anyhow::Result<bool> {
    let email = email.trim().to_lowercase();
    let existing = sqlx::query_as::<_, UserAccount>("SELECT * FROM users WHERE email = $1 LIMIT 1")
        .bind(&email)
        .fetch_optional(pg)
        .await?;
    if let Some(existing) = existing {
        log::warn!("Account {} already exists with role {:?}", existing.email, existing.role);
        return Ok(false);
    }
    let hash = hash_password(password).map_err(|err| anyhow::anyhow!("{:?}", err))?;
    sqlx::query(
        "INSERT INTO users (id, name, email, password_hash, role, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(&email)
    .bind(hash)
    .bind(Role::Admin)
    .bind(Utc::now())
    .execute(pg)
    .await?;
    log::info!("Administrator {} created", email);
    Ok(true)
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub formation: Option<String>,
    pub cohort: Option<i32>,
}

impl Profile {
    fn of(user: &UserAccount, enrollment: Option<&Enrollment>) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
            created_at: user.created_at,
            formation: enrollment.map(|e| e.formation.clone()),
            cohort: enrollment.and_then(|e| e.cohort),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedIn {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: Profile,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedOut {
    pub user_id: Uuid,
    pub logged_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifiedSession {
    pub user: Profile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnrollmentStatus;

    fn account(role: Role) -> UserAccount {
        UserAccount {
            id: Uuid::new_v4(),
            name: "Awa Diop".into(),
            email: "awa@example.org".into(),
            password_hash: String::new(),
            role,
            created_at: Utc::now(),
        }
    }

    fn enrollment(active: bool) -> Enrollment {
        Enrollment {
            id: Uuid::new_v4(),
            last_name: "Diop".into(),
            first_name: "Awa".into(),
            email: "awa@example.org".into(),
            phone: "770000000".into(),
            formation: "dev-web".into(),
            access_code: "1234".into(),
            status: EnrollmentStatus::Validated,
            cohort: Some(2),
            enrollment_fee: Some(10_000),
            months: Some(6),
            monthly_fee: Some(50_000),
            active,
            formation_end_date: None,
            validated_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn access_codes_hash_and_verify() {
        let hash = hash_password("4821").unwrap();
        assert!(hash.starts_with("$pbkdf2"));
        assert!(verify_password("4821", &hash).unwrap());
        assert!(!verify_password("4822", &hash).unwrap());
    }

    #[test]
    fn tokens_are_hex_sha256() {
        let a = new_token();
        let b = new_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn student_sessions_need_an_active_enrollment() {
        let session = |role, enrollment| Session {
            token: "t".into(),
            user: account(role),
            enrollment,
        };
        assert!(student_of(session(Role::Student, Some(enrollment(true)))).is_ok());
        assert!(matches!(
            student_of(session(Role::Student, Some(enrollment(false)))),
            Err(Error::Forbidden { .. })
        ));
        assert!(matches!(
            student_of(session(Role::Student, None)),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            student_of(session(Role::Admin, None)),
            Err(Error::Forbidden { .. })
        ));
    }

    #[test]
    fn admin_profiles_omit_student_fields() {
        let json = serde_json::to_value(Profile::of(&account(Role::Admin), None)).unwrap();
        assert_eq!(json["role"], "ADMIN");
        assert!(json.get("formation").is_none());

        let e = enrollment(true);
        let json = serde_json::to_value(Profile::of(&account(Role::Student), Some(&e))).unwrap();
        assert_eq!(json["formation"], "dev-web");
        assert_eq!(json["cohort"], 2);
    }

    #[test]
    fn login_purges_only_the_users_expired_sessions() {
        assert!(PURGE_EXPIRED_SESSIONS.starts_with("DELETE FROM user_sessions"));
        assert!(PURGE_EXPIRED_SESSIONS.contains("user_id = $1"));
        assert!(PURGE_EXPIRED_SESSIONS.contains("expires_at <= NOW()"));
    }
}
