//! Redis-backed durable store.
//!
//! One JSON document per deployment at `{prefix}deployments:{id}`, an
//! append-only log list at `{prefix}logs:{id}`, and a fingerprint key for
//! reuse lookups. Compare-and-set runs as a Lua script so the status check
//! and the write are one atomic step on the server.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use super::{fingerprint, DeploymentPatch, DeploymentStore, StoreError};
use crate::entities::{Deployment, DeploymentStatus, LogEntry, LogLevel};

/// CAS script: decode the stored document, verify its status is one of the
/// expected values, merge the patch, write back. Returns the new document
/// JSON, or `CONFLICT <status>` / `NOTFOUND` sentinels.
const CAS_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return 'NOTFOUND'
end
local doc = cjson.decode(raw)
local expected = cjson.decode(ARGV[1])
if #expected > 0 then
  local ok = false
  for _, status in ipairs(expected) do
    if doc.status == status then ok = true end
  end
  if not ok then
    return 'CONFLICT ' .. doc.status
  end
end
local patch = cjson.decode(ARGV[2])
for key, value in pairs(patch) do
  if key == 'push_attempt' then
    local attempts = doc.attempts or {}
    table.insert(attempts, value)
    doc.attempts = attempts
  elseif key == 'ready_at' then
    if doc.ready_at == nil then doc.ready_at = value end
  else
    doc[key] = value
  end
end
doc.updated_at = ARGV[3]
local encoded = cjson.encode(doc)
redis.call('SET', KEYS[1], encoded)
return encoded
"#;

/// Durable [`DeploymentStore`] on Redis.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    cas: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        info!("Connected to Redis deployment store");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn deployment_key(&self, id: &str) -> String {
        format!("{}deployments:{id}", self.prefix)
    }

    fn logs_key(&self, id: &str) -> String {
        format!("{}logs:{id}", self.prefix)
    }

    fn fingerprint_key(&self, key: &str) -> String {
        format!("{}fingerprint:{key}", self.prefix)
    }

    fn decode(raw: &str) -> Result<Deployment, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Backend(format!("bad document: {e}")))
    }
}

/// Serialize only the set fields of a patch for the Lua merge.
fn patch_json(patch: &DeploymentPatch) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    if let Some(status) = patch.status {
        map.insert("status".into(), status.as_str().into());
    }
    if let Some(v) = patch.min_vram_gb {
        map.insert("min_vram_gb".into(), v.into());
    }
    if let Some(ref v) = patch.resolved_tier {
        map.insert("resolved_tier".into(), v.clone().into());
    }
    if let Some(ref v) = patch.gpu_allocated {
        map.insert("gpu_allocated".into(), v.clone().into());
    }
    if let Some(ref v) = patch.endpoint_id {
        map.insert("endpoint_id".into(), v.clone().into());
    }
    if let Some(ref v) = patch.endpoint_url {
        map.insert("endpoint_url".into(), v.clone().into());
    }
    if let Some(ref v) = patch.error {
        map.insert("error".into(), serde_json::to_value(v).unwrap_or_default());
    }
    if let Some(v) = patch.ready_at {
        map.insert("ready_at".into(), v.to_rfc3339().into());
    }
    if let Some(ref attempt) = patch.push_attempt {
        map.insert(
            "push_attempt".into(),
            serde_json::to_value(attempt).unwrap_or_default(),
        );
    }
    serde_json::Value::Object(map)
}

#[async_trait]
impl DeploymentStore for RedisStore {
    async fn create(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.deployment_key(&deployment.id);
        let raw = serde_json::to_string(deployment)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let created: bool = conn
            .set_nx(&key, &raw)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if !created {
            return Err(StoreError::AlreadyExists(deployment.id.clone()));
        }

        let fp = self.fingerprint_key(&fingerprint(
            &deployment.owner_hash,
            &deployment.model_id,
            deployment.requested_tier.as_deref(),
        ));
        let _: () = conn
            .set(&fp, &deployment.id)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: &str, owner_hash: &str) -> Result<Deployment, StoreError> {
        let dep = self.fetch(id).await?;
        if dep.owner_hash != owner_hash {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(dep)
    }

    async fn fetch(&self, id: &str) -> Result<Deployment, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.deployment_key(id))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let raw = raw.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Self::decode(&raw)
    }

    async fn update(
        &self,
        id: &str,
        patch: DeploymentPatch,
        expected: &[DeploymentStatus],
    ) -> Result<Deployment, StoreError> {
        let mut conn = self.conn.clone();
        let expected_json = serde_json::to_string(
            &expected.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let result: String = self
            .cas
            .key(self.deployment_key(id))
            .arg(expected_json)
            .arg(patch_json(&patch).to_string())
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result == "NOTFOUND" {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if let Some(actual) = result.strip_prefix("CONFLICT ") {
            let actual = DeploymentStatus::parse(actual)
                .ok_or_else(|| StoreError::Backend(format!("unknown status {actual}")))?;
            return Err(StoreError::Conflict { actual });
        }
        Self::decode(&result)
    }

    async fn append_log(&self, id: &str, level: LogLevel, message: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
        };
        let raw = serde_json::to_string(&entry).map_err(|e| StoreError::Backend(e.to_string()))?;
        let _: () = conn
            .rpush(self.logs_key(id), raw)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn logs(&self, id: &str, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(self.logs_key(id), -(limit as isize), -1)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        raw.iter()
            .map(|entry| {
                serde_json::from_str(entry)
                    .map_err(|e| StoreError::Backend(format!("bad log entry: {e}")))
            })
            .collect()
    }

    async fn find_reusable(
        &self,
        owner_hash: &str,
        model_id: &str,
        requested_tier: Option<&str>,
    ) -> Result<Option<Deployment>, StoreError> {
        let mut conn = self.conn.clone();
        let fp = self.fingerprint_key(&fingerprint(owner_hash, model_id, requested_tier));
        let id: Option<String> = conn
            .get(&fp)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let Some(id) = id else { return Ok(None) };

        match self.fetch(&id).await {
            Ok(dep)
                if !matches!(
                    dep.status,
                    DeploymentStatus::Failed
                        | DeploymentStatus::Deleted
                        | DeploymentStatus::Timeout
                ) =>
            {
                Ok(Some(dep))
            }
            Ok(_) => Ok(None),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_json_includes_only_set_fields() {
        let mut patch = DeploymentPatch::status(DeploymentStatus::Ready);
        patch.endpoint_url = Some("https://api.runpod.ai/v2/ep_1/run".to_string());
        let json = patch_json(&patch);
        assert_eq!(json["status"], "ready");
        assert_eq!(json["endpoint_url"], "https://api.runpod.ai/v2/ep_1/run");
        assert!(json.get("error").is_none());
        assert!(json.get("min_vram_gb").is_none());
    }

    #[test]
    fn patch_json_attempt_is_nested_object() {
        let mut patch = DeploymentPatch::default();
        patch.push_attempt = Some(crate::entities::Attempt {
            tier_id: "AMPERE_48".to_string(),
            failure_reason: "no capacity".to_string(),
        });
        let json = patch_json(&patch);
        assert_eq!(json["push_attempt"]["tier_id"], "AMPERE_48");
    }
}
