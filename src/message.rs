use std::str::FromStr;
use std::sync::Arc;

use axum::extract::Path;
use axum::Extension;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::Admin;
use crate::form::{self, JsonBody};
use crate::models::ContactMessage;
use crate::{created, mail, proceeds, Context, Created, Error, Payload};

pub async fn send(
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    JsonBody(body): JsonBody<MessageRequest>,
) -> Created<MessageItem> {
    let first_name = form::required("first_name", body.first_name.as_ref())?;
    let last_name = form::required("last_name", body.last_name.as_ref())?;
    let email = form::email(body.email.as_ref())?;
    let subject = form::required("subject", body.subject.as_ref())?;
    let text = form::required("message", body.message.as_ref())?;
    let phone = form::optional(body.phone.as_ref()).unwrap_or_default();

    let message = sqlx::query_as::<_, ContactMessage>(
        "INSERT INTO contact_messages (id, first_name, last_name, email, phone, subject, body, is_read, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, NOW()) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(first_name)
    .bind(last_name)
    .bind(email)
    .bind(phone)
    .bind(subject)
    .bind(text)
    .fetch_one(&pg)
    .await?;

    log::info!("Contact message {} from {}", message.id, message.email);
    ctx.mailer
        .dispatch(mail::contact_to_admin(ctx.mailer.admin(), &message));
    ctx.mailer.dispatch(mail::contact_acknowledgement(&message));
    created(MessageItem { message })
}

pub async fn list(_: Admin, Extension(pg): Extension<PgPool>) -> Payload<MessageList> {
    let messages =
        sqlx::query_as::<_, ContactMessage>("SELECT * FROM contact_messages ORDER BY created_at DESC")
            .fetch_all(&pg)
            .await?;
    proceeds(MessageList {
        count: messages.len(),
        messages,
    })
}

pub async fn overview(_: Admin, Extension(pg): Extension<PgPool>) -> Payload<MessageStats> {
    let since = Utc::now() - Duration::days(7);
    let (total, unread, recent) = sqlx::query_as::<_, (i64, i64, i64)>(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE NOT is_read), COUNT(*) FILTER (WHERE created_at >= $1) \
         FROM contact_messages",
    )
    .bind(since)
    .fetch_one(&pg)
    .await?;
    proceeds(MessageStats {
        total,
        unread,
        read: total - unread,
        last_7_days: recent,
    })
}

pub async fn get(_: Admin, Extension(pg): Extension<PgPool>, Path(id): Path<String>) -> Payload<MessageItem> {
    let id = Uuid::from_str(&id)?;
    let message = sqlx::query_as::<_, ContactMessage>("SELECT * FROM contact_messages WHERE id = $1")
        .bind(id)
        .fetch_optional(&pg)
        .await?
        .ok_or_else(|| Error::not_found("Message not found"))?;
    proceeds(MessageItem { message })
}

async fn mark(pg: &PgPool, id: &str, read: bool) -> Payload<MessageItem> {
    let id = Uuid::from_str(id)?;
    let message = sqlx::query_as::<_, ContactMessage>(
        "UPDATE contact_messages SET is_read = $2 WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(read)
    .fetch_optional(pg)
    .await?
    .ok_or_else(|| Error::not_found("Message not found"))?;
    proceeds(MessageItem { message })
}

pub async fn mark_read(_: Admin, Extension(pg): Extension<PgPool>, Path(id): Path<String>) -> Payload<MessageItem> {
    mark(&pg, &id, true).await
}

pub async fn mark_unread(_: Admin, Extension(pg): Extension<PgPool>, Path(id): Path<String>) -> Payload<MessageItem> {
    mark(&pg, &id, false).await
}

pub async fn delete(_: Admin, Extension(pg): Extension<PgPool>, Path(id): Path<String>) -> Payload<MessagesDeleted> {
    let id = Uuid::from_str(&id)?;
    let res = sqlx::query("DELETE FROM contact_messages WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return Err(Error::not_found("Message not found"));
    }
    proceeds(MessagesDeleted { deleted: 1 })
}

pub fn parse_ids(ids: Option<&Vec<String>>) -> Result<Vec<Uuid>, Error> {
    let ids = match ids {
        Some(ids) if !ids.is_empty() => ids,
        _ => return Err(Error::invalid("`ids` must be a non-empty list")),
    };
    ids.iter()
        .map(|id| Uuid::from_str(id.trim()).map_err(Error::from))
        .collect()
}

pub async fn bulk_delete(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    JsonBody(body): JsonBody<BulkDeleteRequest>,
) -> Payload<MessagesDeleted> {
    let ids = parse_ids(body.ids.as_ref())?;
    let res = sqlx::query("DELETE FROM contact_messages WHERE id = ANY($1)")
        .bind(ids)
        .execute(&pg)
        .await?;
    log::info!("Deleted {} contact messages", res.rows_affected());
    proceeds(MessagesDeleted {
        deleted: res.rows_affected(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub subject: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageItem {
    pub message: ContactMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageList {
    pub count: usize,
    pub messages: Vec<ContactMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageStats {
    pub total: i64,
    pub unread: i64,
    pub read: i64,
    pub last_7_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesDeleted {
    pub deleted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_delete_needs_ids() {
        assert!(matches!(parse_ids(None), Err(Error::InvalidPayload { .. })));
        assert!(parse_ids(Some(&Vec::new())).is_err());
        assert!(parse_ids(Some(&vec!["not-a-uuid".to_string()])).is_err());

        let id = Uuid::new_v4();
        assert_eq!(parse_ids(Some(&vec![id.to_string()])).unwrap(), vec![id]);
    }

    #[test]
    fn message_requests_keep_optional_phone() {
        let body: MessageRequest = serde_json::from_str(
            r#"{"first_name":"Awa","last_name":"Diop","email":"awa@example.org","subject":"Fees","message":"Hi"}"#,
        )
        .unwrap();
        assert_eq!(form::optional(body.phone.as_ref()), None);
        assert_eq!(form::email(body.email.as_ref()).unwrap(), "awa@example.org");
    }
}
