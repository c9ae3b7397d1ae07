//! Cache/broker client: Redis spoken through its REST endpoint.
//!
//! The gateway needs five primitives from the cache: point reads, TTL'd
//! writes, set-if-not-exists (job creation must be linearisable per token),
//! compare-and-swap (status transitions), and channel publish (hand-off to
//! the data-loading worker). Everything is issued as a single Redis command
//! serialised as a JSON array against the REST endpoint, so each call is
//! individually atomic and no connection state is held across requests.
//!
//! Binary chunk payloads are stored base64-encoded by the worker; readers
//! decode on the way out.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};

#[derive(Deserialize)]
struct CommandResp {
    result: serde_json::Value,
}

/// Thin Redis-over-REST client. Cheap to clone; the underlying HTTP pool is
/// shared.
#[derive(Clone)]
pub struct CacheClient {
    url: String,
    user: String,
    password: String,
    http: reqwest::Client,
}

impl CacheClient {
    pub fn new(url: &str, user: &str, password: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn auth(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.user.is_empty() {
            rb.header("Authorization", format!("Bearer {}", self.password))
        } else {
            rb.basic_auth(&self.user, Some(&self.password))
        }
    }

    /// Run one Redis command. The REST endpoint takes the command as a JSON
    /// array and answers `{"result": …}`.
    async fn command(&self, cmd: &[&str]) -> ApiResult<serde_json::Value> {
        let res = self
            .auth(self.http.post(&self.url))
            .json(&cmd)
            .send()
            .await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(ApiError::BackendUnavailable(format!(
                "cache {} {}: {}",
                cmd.first().unwrap_or(&"?"),
                status,
                text
            )));
        }
        let parsed: CommandResp = serde_json::from_str(&text)
            .map_err(|e| ApiError::internal(anyhow::anyhow!("cache response: {e}")))?;
        Ok(parsed.result)
    }

    /// GET a string value.
    pub async fn get(&self, key: &str) -> ApiResult<Option<String>> {
        match self.command(&["GET", key]).await? {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    /// GET a binary value (stored base64-encoded).
    pub async fn get_bytes(&self, key: &str) -> ApiResult<Option<Vec<u8>>> {
        match self.get(key).await? {
            None => Ok(None),
            Some(s) => B64
                .decode(s.as_bytes())
                .map(Some)
                .map_err(|e| ApiError::internal(anyhow::anyhow!("cache blob {key}: {e}"))),
        }
    }

    /// SET with a TTL.
    pub async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> ApiResult<()> {
        let secs = seconds.to_string();
        self.command(&["SET", key, value, "EX", &secs]).await?;
        Ok(())
    }

    /// SET with a TTL, only if the key does not exist. Returns whether the
    /// write happened.
    pub async fn set_nx_ex(&self, key: &str, value: &str, seconds: u64) -> ApiResult<bool> {
        let secs = seconds.to_string();
        let result = self
            .command(&["SET", key, value, "EX", &secs, "NX"])
            .await?;
        // Redis answers OK on success, null when the key already existed.
        Ok(!result.is_null())
    }

    /// Atomically replace `key` only while it still holds `expected`.
    /// Returns whether the swap happened.
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
        seconds: u64,
    ) -> ApiResult<bool> {
        const SCRIPT: &str = "if redis.call('GET', KEYS[1]) == ARGV[1] then \
             return redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3]) \
             else return nil end";
        let secs = seconds.to_string();
        let result = self
            .command(&["EVAL", SCRIPT, "1", key, expected, new_value, &secs])
            .await?;
        Ok(!result.is_null())
    }

    /// DEL one key.
    pub async fn del(&self, key: &str) -> ApiResult<()> {
        self.command(&["DEL", key]).await?;
        Ok(())
    }

    /// PUBLISH a payload to a channel; returns the receiver count.
    pub async fn publish(&self, channel: &str, payload: &str) -> ApiResult<i64> {
        let result = self.command(&["PUBLISH", channel, payload]).await?;
        result
            .as_i64()
            .ok_or_else(|| ApiError::internal(anyhow::anyhow!("publish: non-numeric reply")))
    }

    /// PING, used by the health probe.
    pub async fn ping(&self) -> ApiResult<()> {
        self.command(&["PING"]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_response_parses_result_variants() {
        let ok: CommandResp = serde_json::from_str(r#"{"result":"OK"}"#).unwrap();
        assert_eq!(ok.result, serde_json::json!("OK"));
        let nil: CommandResp = serde_json::from_str(r#"{"result":null}"#).unwrap();
        assert!(nil.result.is_null());
        let n: CommandResp = serde_json::from_str(r#"{"result":3}"#).unwrap();
        assert_eq!(n.result.as_i64(), Some(3));
    }

    #[test]
    fn blob_decoding_is_base64() {
        let raw = b"zarr chunk bytes";
        let encoded = B64.encode(raw);
        assert_eq!(B64.decode(encoded.as_bytes()).unwrap(), raw);
    }
}
