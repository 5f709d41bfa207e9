//! Field checks shared by the public forms.

use axum::async_trait;
use axum::body::HttpBody;
use axum::extract::{FromRequest, RequestParts};
use axum::{BoxError, Json};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::models::SubmissionStatus;
use crate::Error;

/// JSON request body. Malformed or mistyped bodies answer `InvalidPayload`
/// in the usual error envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, B> FromRequest<B> for JsonBody<T>
where
    T: DeserializeOwned,
    B: HttpBody + Send,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(Error::invalid(rejection.to_string())),
        }
    }
}

/// Trimmed value of a required text field.
pub fn required(field: &str, value: Option<&String>) -> Result<String, Error> {
    match value.map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(Error::invalid(format!("`{}` is required", field))),
    }
}

pub fn optional(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `local@domain.tld` with no whitespace and a single `@`.
pub fn looks_like_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut halves = email.split('@');
    let (local, domain) = match (halves.next(), halves.next(), halves.next()) {
        (Some(local), Some(domain), None) => (local, domain),
        _ => return false,
    };
    if local.is_empty() {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty() && !host.starts_with('.'),
        None => false,
    }
}

pub fn email(value: Option<&String>) -> Result<String, Error> {
    let email = required("email", value)?.to_lowercase();
    if !looks_like_email(&email) {
        return Err(Error::invalid(format!("`{}` is not a valid email address", email)));
    }
    Ok(email)
}

/// Query-string filters accepted by the admin listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Filter {
    pub formation: Option<String>,
    pub cohort: Option<i32>,
    pub status: Option<SubmissionStatus>,
    pub month: Option<i32>,
}

impl Filter {
    /// Non-blank formation filter, matched case-insensitively as a substring.
    pub fn formation(&self) -> Option<String> {
        optional(self.formation.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    #[derive(Debug, Deserialize)]
    struct MonthBody {
        month: i32,
    }

    async fn parse(content_type: Option<&str>, body: &'static str) -> Result<MonthBody, Error> {
        let mut req = Request::builder().method("POST").uri("/api/payments/student/request");
        if let Some(content_type) = content_type {
            req = req.header("content-type", content_type);
        }
        let mut parts = RequestParts::new(req.body(Body::from(body)).unwrap());
        JsonBody::<MonthBody>::from_request(&mut parts)
            .await
            .map(|JsonBody(body)| body)
    }

    #[tokio::test]
    async fn json_bodies_parse() {
        let body = parse(Some("application/json"), r#"{"month": 3}"#).await.unwrap();
        assert_eq!(body.month, 3);
    }

    #[tokio::test]
    async fn bad_json_bodies_are_invalid_payloads() {
        for (content_type, body) in [
            (Some("application/json"), r#"{"month": "three"}"#),
            (Some("application/json"), r#"{"month": 3"#),
            (None, r#"{"month": 3}"#),
        ] {
            let err = parse(content_type, body).await.unwrap_err();
            assert!(matches!(err, Error::InvalidPayload { .. }));
            assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn required_fields_are_trimmed() {
        assert_eq!(required("name", Some(&"  Awa ".to_string())).unwrap(), "Awa");
        assert!(matches!(
            required("name", Some(&"   ".to_string())),
            Err(Error::InvalidPayload { .. })
        ));
        assert!(required("name", None).is_err());
        assert_eq!(optional(Some(&" ".to_string())), None);
    }

    #[test]
    fn email_shapes() {
        assert!(looks_like_email("awa.diop@example.sn"));
        assert!(looks_like_email("a@b.co"));
        assert!(!looks_like_email("awa"));
        assert!(!looks_like_email("@example.org"));
        assert!(!looks_like_email("awa@example"));
        assert!(!looks_like_email("awa@.org"));
        assert!(!looks_like_email("awa@@example.org"));
        assert!(!looks_like_email("awa diop@example.org"));
    }

    #[test]
    fn emails_are_lowercased() {
        assert_eq!(email(Some(&"Awa@Example.ORG".to_string())).unwrap(), "awa@example.org");
        assert!(email(Some(&"nope".to_string())).is_err());
    }

    #[test]
    fn blank_formation_filter_is_ignored() {
        let filter = Filter {
            formation: Some("  ".into()),
            ..Filter::default()
        };
        assert_eq!(filter.formation(), None);
    }
}
