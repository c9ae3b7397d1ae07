//! Document store client for the three auxiliary collections.
//!
//! The store holds `searches` (append-only statistics), `user_flavours`
//! (user-defined vocabularies) and `user_data_meta` (bookkeeping for
//! user-uploaded files). None of these are on the hot search path; the
//! authoritative copy of user data lives in the search index.
//!
//! The store is addressed through its REST data API: one POST per operation
//! (`find` / `insert-one` / `replace-one` / `delete-many`) against
//! `<host>/<db>/<collection>/<action>`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};

/// REST client for the document store. Cheap to clone.
#[derive(Clone)]
pub struct DocStore {
    url: String,
    db: String,
    user: String,
    password: String,
    http: reqwest::Client,
}

#[derive(serde::Deserialize)]
struct FindResp {
    documents: Vec<serde_json::Value>,
}

#[derive(serde::Deserialize)]
struct CountResp {
    #[serde(default)]
    deleted_count: u64,
}

impl DocStore {
    pub fn new(url: &str, db: &str, user: &str, password: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            db: db.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post(
        &self,
        collection: &str,
        action: &str,
        body: serde_json::Value,
    ) -> ApiResult<serde_json::Value> {
        let url = format!("{}/{}/{}/{}", self.url, self.db, collection, action);
        let mut rb = self.http.post(&url).json(&body);
        if !self.user.is_empty() {
            rb = rb.basic_auth(&self.user, Some(&self.password));
        }
        let res = rb.send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(ApiError::BackendUnavailable(format!(
                "document store {collection}/{action} {status}: {text}"
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| ApiError::internal(anyhow::anyhow!("document store response: {e}")))
    }

    /// All documents of a collection.
    pub async fn find_all<T: DeserializeOwned>(&self, collection: &str) -> ApiResult<Vec<T>> {
        self.find(collection, serde_json::json!({})).await
    }

    /// Documents matching a filter.
    pub async fn find<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: serde_json::Value,
    ) -> ApiResult<Vec<T>> {
        let raw = self
            .post(collection, "find", serde_json::json!({ "filter": filter }))
            .await?;
        let resp: FindResp = serde_json::from_value(raw)
            .map_err(|e| ApiError::internal(anyhow::anyhow!("find response: {e}")))?;
        resp.documents
            .into_iter()
            .map(|d| {
                serde_json::from_value(d)
                    .map_err(|e| ApiError::internal(anyhow::anyhow!("document decode: {e}")))
            })
            .collect()
    }

    /// Insert a single document.
    pub async fn insert_one<T: Serialize>(&self, collection: &str, doc: &T) -> ApiResult<()> {
        let doc = serde_json::to_value(doc)
            .map_err(|e| ApiError::internal(anyhow::anyhow!("document encode: {e}")))?;
        self.post(collection, "insert-one", serde_json::json!({ "document": doc }))
            .await?;
        Ok(())
    }

    /// Replace the first document matching `filter`.
    pub async fn replace_one<T: Serialize>(
        &self,
        collection: &str,
        filter: serde_json::Value,
        doc: &T,
    ) -> ApiResult<()> {
        let doc = serde_json::to_value(doc)
            .map_err(|e| ApiError::internal(anyhow::anyhow!("document encode: {e}")))?;
        self.post(
            collection,
            "replace-one",
            serde_json::json!({ "filter": filter, "replacement": doc }),
        )
        .await?;
        Ok(())
    }

    /// Delete every document matching `filter`; returns the count.
    pub async fn delete_many(
        &self,
        collection: &str,
        filter: serde_json::Value,
    ) -> ApiResult<u64> {
        let raw = self
            .post(collection, "delete-many", serde_json::json!({ "filter": filter }))
            .await?;
        let resp: CountResp = serde_json::from_value(raw).unwrap_or(CountResp { deleted_count: 0 });
        Ok(resp.deleted_count)
    }
}
