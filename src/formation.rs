use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Multipart, Path};
use axum::Extension;
use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::Admin;
use crate::io::LocalStore;
use crate::models::Formation;
use crate::{created, proceeds, Context, Created, Error, Payload};

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpeg", "jpg", "png", "gif", "webp"];
const BROCHURE_EXTENSIONS: [&str; 3] = ["pdf", "doc", "docx"];

fn fold(c: char) -> &'static str {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => "a",
        'ç' => "c",
        'è' | 'é' | 'ê' | 'ë' => "e",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'ñ' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => "o",
        'ù' | 'ú' | 'û' | 'ü' => "u",
        'ý' | 'ÿ' => "y",
        'æ' => "ae",
        'œ' => "oe",
        _ => "",
    }
}

/// Lowercase ASCII slug; accents are folded, any other run of characters
/// becomes a single `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut dash = false;
    for c in title.to_lowercase().chars() {
        let piece = if c.is_ascii_alphanumeric() {
            Some(c.to_string())
        } else {
            Some(fold(c)).filter(|s| !s.is_empty()).map(str::to_string)
        };
        match piece {
            Some(piece) => {
                if dash && !slug.is_empty() {
                    slug.push('-');
                }
                dash = false;
                slug.push_str(&piece);
            }
            None => dash = true,
        }
    }
    slug
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Brochure,
}

impl AssetKind {
    fn dir(self) -> &'static str {
        match self {
            AssetKind::Image => "uploads/formations/images",
            AssetKind::Brochure => "uploads/formations/brochures",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub kind: AssetKind,
    pub extension: String,
    pub bytes: Vec<u8>,
}

fn extension_of(file_name: &str) -> String {
    std::path::Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Checks an uploaded file against the rules of its field.
pub fn check_upload(
    kind: AssetKind,
    file_name: &str,
    content_type: Option<&str>,
    bytes: Vec<u8>,
) -> Result<Upload, Error> {
    if bytes.is_empty() {
        return Err(Error::invalid(format!("Uploaded file `{}` is empty", file_name)));
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(Error::invalid(format!(
            "Uploaded file `{}` exceeds 10 MiB",
            file_name
        )));
    }
    let extension = extension_of(file_name);
    let content_type = content_type.unwrap_or_default();
    let accepted = match kind {
        AssetKind::Image => {
            IMAGE_EXTENSIONS.contains(&extension.as_str()) && content_type.starts_with("image/")
        }
        AssetKind::Brochure => BROCHURE_EXTENSIONS.contains(&extension.as_str()),
    };
    if !accepted {
        return Err(Error::invalid(match kind {
            AssetKind::Image => "Only JPEG, JPG, PNG, GIF and WEBP images are accepted",
            AssetKind::Brochure => "Only PDF, DOC and DOCX brochures are accepted",
        }));
    }
    Ok(Upload {
        kind,
        extension,
        bytes,
    })
}

/// Appends `chunk` unless that would take `buf` past `limit`.
fn append_bounded(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    if buf.len() + chunk.len() > limit {
        return false;
    }
    buf.extend_from_slice(chunk);
    true
}

/// Text fields and files of a formation form.
#[derive(Debug, Default)]
pub struct FormationForm {
    pub fields: HashMap<String, String>,
    pub image: Option<Upload>,
    pub brochure: Option<Upload>,
}

impl FormationForm {
    pub async fn read(mut multipart: Multipart) -> Result<Self, Error> {
        let mut form = FormationForm::default();
        while let Some(mut field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            let kind = match name.as_str() {
                "image" => Some(AssetKind::Image),
                "brochure" => Some(AssetKind::Brochure),
                _ => None,
            };
            match kind {
                Some(kind) => {
                    let file_name = field.file_name().unwrap_or_default().to_string();
                    let content_type = field.content_type().map(|m| m.to_string());
                    let mut bytes = Vec::new();
                    while let Some(chunk) = field.chunk().await? {
                        if !append_bounded(&mut bytes, &chunk, MAX_UPLOAD_BYTES) {
                            return Err(Error::invalid(format!(
                                "Uploaded file `{}` exceeds 10 MiB",
                                file_name
                            )));
                        }
                    }
                    if file_name.is_empty() && bytes.is_empty() {
                        continue;
                    }
                    let upload = check_upload(kind, &file_name, content_type.as_deref(), bytes)?;
                    match kind {
                        AssetKind::Image => form.image = Some(upload),
                        AssetKind::Brochure => form.brochure = Some(upload),
                    }
                }
                None => {
                    let text = field.text().await?;
                    form.fields.insert(name, text);
                }
            }
        }
        Ok(form)
    }

    /// Trimmed, non-blank text field.
    pub fn text(&self, name: &str) -> Option<String> {
        crate::form::optional(self.fields.get(name))
    }

    pub fn price(&self, name: &str) -> Result<Option<i64>, Error> {
        match self.text(name) {
            None => Ok(None),
            Some(raw) => match raw.parse::<i64>() {
                Ok(price) if price >= 0 => Ok(Some(price)),
                _ => Err(Error::invalid(format!("`{}` must be a non-negative integer", name))),
            },
        }
    }
}

/// Stores an upload and returns its public URL.
async fn save_asset(store: &LocalStore, public_url: &str, upload: &Upload) -> Result<String, Error> {
    let rel = format!("{}/{}.{}", upload.kind.dir(), Uuid::new_v4(), upload.extension);
    store.write(&rel, &upload.bytes).await?;
    Ok(format!("{}/{}", public_url, rel))
}

/// Store path behind one of our own asset URLs.
pub fn asset_path(public_url: &str, url: &str) -> Option<String> {
    let rel = url.strip_prefix(public_url)?.strip_prefix('/')?;
    if rel.starts_with("uploads/") {
        Some(rel.to_string())
    } else {
        None
    }
}

async fn drop_asset(store: &LocalStore, public_url: &str, url: Option<&String>) {
    let path = match url.and_then(|url| asset_path(public_url, url)) {
        Some(path) => path,
        None => return,
    };
    if let Err(err) = store.remove(&path).await {
        log::warn!("Could not delete asset {}: {:#}", path, err);
    }
}

pub async fn list(Extension(pg): Extension<PgPool>) -> Payload<FormationList> {
    let formations = sqlx::query_as::<_, Formation>("SELECT * FROM formations ORDER BY created_at DESC")
        .fetch_all(&pg)
        .await?;
    proceeds(FormationList {
        count: formations.len(),
        formations,
    })
}

pub async fn by_category(
    Extension(pg): Extension<PgPool>,
    Path(category): Path<String>,
) -> Payload<FormationList> {
    let formations = sqlx::query_as::<_, Formation>(
        "SELECT * FROM formations WHERE LOWER(category) = LOWER($1) ORDER BY created_at DESC",
    )
    .bind(category.trim())
    .fetch_all(&pg)
    .await?;
    proceeds(FormationList {
        count: formations.len(),
        formations,
    })
}

pub async fn by_slug(Extension(pg): Extension<PgPool>, Path(slug): Path<String>) -> Payload<FormationItem> {
    let formation = sqlx::query_as::<_, Formation>("SELECT * FROM formations WHERE slug = $1")
        .bind(slug)
        .fetch_optional(&pg)
        .await?
        .ok_or_else(|| Error::not_found("Formation not found"))?;
    proceeds(FormationItem { formation })
}

async fn find(pg: &PgPool, id: Uuid) -> Result<Formation, Error> {
    sqlx::query_as::<_, Formation>("SELECT * FROM formations WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found("Formation not found"))
}

pub async fn by_id(Extension(pg): Extension<PgPool>, Path(id): Path<String>) -> Payload<FormationItem> {
    let id = Uuid::from_str(&id)?;
    proceeds(FormationItem {
        formation: find(&pg, id).await?,
    })
}

pub async fn create(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    multipart: Multipart,
) -> Created<FormationItem> {
    let form = FormationForm::read(multipart).await?;
    let title = form
        .text("title")
        .ok_or_else(|| Error::invalid("`title` is required"))?;
    let slug = slugify(&title);
    if slug.is_empty() {
        return Err(Error::invalid("`title` must contain letters or digits"));
    }
    let price_onsite = form.price("price_onsite")?;
    let price_online = form.price("price_online")?;

    let public_url = &ctx.config.public_url;
    let image_url = match &form.image {
        Some(upload) => Some(save_asset(&ctx.store, public_url, upload).await?),
        None => None,
    };
    let brochure_url = match &form.brochure {
        Some(upload) => Some(save_asset(&ctx.store, public_url, upload).await?),
        None => None,
    };

    let now = Utc::now();
    let formation = sqlx::query_as::<_, Formation>(
        "INSERT INTO formations \
         (id, title, slug, description, program, duration, price_onsite, price_online, \
          image_url, brochure_url, category, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&title)
    .bind(&slug)
    .bind(form.text("description"))
    .bind(form.text("program"))
    .bind(form.text("duration"))
    .bind(price_onsite)
    .bind(price_online)
    .bind(&image_url)
    .bind(&brochure_url)
    .bind(form.text("category"))
    .bind(now)
    .fetch_one(&pg)
    .await;

    let formation = match formation {
        Ok(formation) => formation,
        Err(err) => {
            drop_asset(&ctx.store, public_url, image_url.as_ref()).await;
            drop_asset(&ctx.store, public_url, brochure_url.as_ref()).await;
            return Err(err.into());
        }
    };
    log::info!("Formation {} created ({})", formation.slug, formation.id);
    created(FormationItem { formation })
}

pub async fn update(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Payload<FormationItem> {
    let id = Uuid::from_str(&id)?;
    let existing = find(&pg, id).await?;
    let form = FormationForm::read(multipart).await?;
    let public_url = &ctx.config.public_url;

    let (title, slug) = match form.text("title") {
        Some(title) => {
            let slug = slugify(&title);
            if slug.is_empty() {
                return Err(Error::invalid("`title` must contain letters or digits"));
            }
            (title, slug)
        }
        None => (existing.title.clone(), existing.slug.clone()),
    };
    let price_onsite = form.price("price_onsite")?.or(existing.price_onsite);
    let price_online = form.price("price_online")?.or(existing.price_online);

    let image_url = match &form.image {
        Some(upload) => Some(save_asset(&ctx.store, public_url, upload).await?),
        None => existing.image_url.clone(),
    };
    let brochure_url = match &form.brochure {
        Some(upload) => Some(save_asset(&ctx.store, public_url, upload).await?),
        None => existing.brochure_url.clone(),
    };

    let formation = sqlx::query_as::<_, Formation>(
        "UPDATE formations SET title = $2, slug = $3, description = $4, program = $5, duration = $6, \
         price_onsite = $7, price_online = $8, image_url = $9, brochure_url = $10, category = $11, \
         updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(title)
    .bind(slug)
    .bind(form.text("description").or(existing.description.clone()))
    .bind(form.text("program").or(existing.program.clone()))
    .bind(form.text("duration").or(existing.duration.clone()))
    .bind(price_onsite)
    .bind(price_online)
    .bind(&image_url)
    .bind(&brochure_url)
    .bind(form.text("category").or(existing.category.clone()))
    .fetch_one(&pg)
    .await?;

    if form.image.is_some() {
        drop_asset(&ctx.store, public_url, existing.image_url.as_ref()).await;
    }
    if form.brochure.is_some() {
        drop_asset(&ctx.store, public_url, existing.brochure_url.as_ref()).await;
    }
    log::info!("Formation {} updated", formation.id);
    proceeds(FormationItem { formation })
}

pub async fn delete(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(id): Path<String>,
) -> Payload<FormationDeleted> {
    let id = Uuid::from_str(&id)?;
    let formation = find(&pg, id).await?;
    sqlx::query("DELETE FROM formations WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    let public_url = &ctx.config.public_url;
    drop_asset(&ctx.store, public_url, formation.image_url.as_ref()).await;
    drop_asset(&ctx.store, public_url, formation.brochure_url.as_ref()).await;
    log::info!("Formation {} deleted", formation.slug);
    proceeds(FormationDeleted {
        id,
        slug: formation.slug,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct FormationList {
    pub count: usize,
    pub formations: Vec<Formation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormationItem {
    pub formation: Formation,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormationDeleted {
    pub id: Uuid,
    pub slug: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_fold_accents_and_collapse_separators() {
        assert_eq!(slugify("Développement Web"), "developpement-web");
        assert_eq!(slugify("  Réseaux & Télécoms -- 2025 "), "reseaux-telecoms-2025");
        assert_eq!(slugify("Cœur de métier: Maçonnerie"), "coeur-de-metier-maconnerie");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn images_need_extension_and_image_type() {
        let ok = check_upload(AssetKind::Image, "cover.PNG", Some("image/png"), vec![1, 2, 3]).unwrap();
        assert_eq!(ok.extension, "png");
        assert!(check_upload(AssetKind::Image, "cover.png", Some("application/pdf"), vec![1]).is_err());
        assert!(check_upload(AssetKind::Image, "cover.bmp", Some("image/bmp"), vec![1]).is_err());
        assert!(check_upload(AssetKind::Image, "cover.png", None, vec![1]).is_err());
    }

    #[test]
    fn brochures_accept_documents_only() {
        assert!(check_upload(AssetKind::Brochure, "plan.pdf", Some("application/pdf"), vec![1]).is_ok());
        assert!(check_upload(AssetKind::Brochure, "plan.docx", None, vec![1]).is_ok());
        assert!(check_upload(AssetKind::Brochure, "plan.exe", Some("application/pdf"), vec![1]).is_err());
    }

    #[test]
    fn uploads_are_size_checked() {
        assert!(check_upload(AssetKind::Brochure, "plan.pdf", None, Vec::new()).is_err());
        let big = vec![0u8; MAX_UPLOAD_BYTES + 1];
        assert!(check_upload(AssetKind::Brochure, "plan.pdf", None, big).is_err());
    }

    #[test]
    fn asset_urls_map_back_to_store_paths() {
        let base = "http://localhost:8000";
        assert_eq!(
            asset_path(base, "http://localhost:8000/uploads/formations/images/a.png").as_deref(),
            Some("uploads/formations/images/a.png")
        );
        assert_eq!(asset_path(base, "https://cdn.example.org/uploads/a.png"), None);
        assert_eq!(asset_path(base, "http://localhost:8000/receipts/x.pdf"), None);
    }

    #[test]
    fn prices_must_be_integers() {
        let mut form = FormationForm::default();
        form.fields.insert("price_onsite".into(), " 150000 ".into());
        form.fields.insert("price_online".into(), "cheap".into());
        assert_eq!(form.price("price_onsite").unwrap(), Some(150_000));
        assert!(form.price("price_online").is_err());
        assert_eq!(form.price("missing").unwrap(), None);
    }

    #[test]
    fn streamed_uploads_stop_at_the_limit() {
        let mut buf = Vec::new();
        assert!(append_bounded(&mut buf, &[1; 6], 10));
        assert!(append_bounded(&mut buf, &[2; 4], 10));
        assert!(!append_bounded(&mut buf, &[3], 10));
        assert_eq!(buf.len(), 10);
    }
}
