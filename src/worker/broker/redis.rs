//! Redis broker
//!
//! Key layout, per queue class `q`:
//!
//! | key                     | type | content                              |
//! |-------------------------|------|--------------------------------------|
//! | `{prefix}:{q}:pending`  | list | ids ready to run (LPUSH / RPOP)      |
//! | `{prefix}:{q}:scheduled`| zset | ids scored by `not_before` (ms)      |
//! | `{prefix}:{q}:active`   | zset | leased ids scored by lease deadline  |
//! | `{prefix}:{q}:archived` | zset | dead ids scored by archive time      |
//! | `{prefix}:t:{id}`       | str  | JSON encoded [`TaskMessage`]         |
//!
//! Every state transition is a single Lua script or MULTI pipeline, so a
//! task id is always in exactly one of the sets above.
//!
//! The dequeue and recovery scripts build task keys from the prefix passed
//! in ARGV instead of declaring them in KEYS. That is fine on a standalone
//! or replicated Redis but not on Redis Cluster, which requires every key a
//! script touches to be declared and to hash to one slot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{Broker, LEASE_EXPIRED, lease_deadline};
use crate::worker::error::QueueError;
use crate::worker::state::TaskState;
use crate::worker::task::{QueueClass, TaskInfo, TaskMessage};

pub const DEFAULT_KEY_PREFIX: &str = "simple_bank";

/// Tasks moved per script call when promoting or recovering
const BATCH: usize = 100;

/// KEYS: scheduled, pending, active. ARGV: now ms, lease deadline ms, task key prefix, batch
///
/// A pending id whose body is gone is logged to the Redis log and skipped.
const DEQUEUE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[4]))
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
local id = redis.call('RPOP', KEYS[2])
while id do
  local body = redis.call('GET', ARGV[3] .. id)
  if body then
    redis.call('ZADD', KEYS[3], ARGV[2], id)
    return body
  end
  redis.log(redis.LOG_WARNING, 'dropping orphan task id ' .. id .. ' from ' .. KEYS[2])
  id = redis.call('RPOP', KEYS[2])
end
return false
";

/// KEYS: active, task key, destination zset. ARGV: id, new body ('' deletes), score
const SETTLE_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if ARGV[2] == '' then
  redis.call('DEL', KEYS[2])
  return 1
end
redis.call('SET', KEYS[2], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
";

/// KEYS: active, scheduled, archived. ARGV: now ms, batch, task key prefix, now RFC 3339, error
///
/// An expired lease is a failed attempt: the body is rewritten with the bumped
/// retry count, then the id goes to `scheduled` (due now) or to `archived`
/// once `max_retry` is spent.
const RECOVER_SCRIPT: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  local key = ARGV[3] .. id
  local body = redis.call('GET', key)
  if body then
    local msg = cjson.decode(body)
    msg['last_error'] = ARGV[5]
    if msg['retry_count'] >= msg['max_retry'] then
      redis.call('SET', key, cjson.encode(msg))
      redis.call('ZADD', KEYS[3], ARGV[1], id)
    else
      msg['retry_count'] = msg['retry_count'] + 1
      msg['not_before'] = ARGV[4]
      redis.call('SET', key, cjson.encode(msg))
      redis.call('ZADD', KEYS[2], ARGV[1], id)
    end
  end
end
return #expired
";

#[derive(Clone)]
pub struct RedisBroker {
    manager: ConnectionManager,
    prefix: String,
    dequeue_script: Script,
    settle_script: Script,
    recover_script: Script,
}

impl RedisBroker {
    /// Connect to Redis and build a broker using `prefix` for every key
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, QueueError> {
        info!("Connecting to Redis at {}", url);
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::Redis(format!("Failed to create Redis client: {e}")))?;
        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Redis connection failed: {}", e);
            QueueError::from(e)
        })?;
        info!("Successfully connected to Redis");
        Ok(Self::from_manager(manager, prefix))
    }

    pub fn from_manager(manager: ConnectionManager, prefix: &str) -> Self {
        Self {
            manager,
            prefix: prefix.to_string(),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
            recover_script: Script::new(RECOVER_SCRIPT),
        }
    }

    fn queue_key(&self, queue: QueueClass, set: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, set)
    }

    fn task_key_prefix(&self) -> String {
        format!("{}:t:", self.prefix)
    }

    fn task_key(&self, id: Uuid) -> String {
        format!("{}{}", self.task_key_prefix(), id)
    }

    /// Number of tasks of `queue` currently in `state`
    ///
    /// Completed tasks are deleted, so that state always counts zero.
    pub async fn queue_len(&self, queue: QueueClass, state: TaskState) -> Result<u64, QueueError> {
        let mut conn = self.manager.clone();
        let len: u64 = match state {
            TaskState::Pending => conn.llen(self.queue_key(queue, "pending")).await?,
            TaskState::Scheduled | TaskState::Retry => {
                conn.zcard(self.queue_key(queue, "scheduled")).await?
            }
            TaskState::Active => conn.zcard(self.queue_key(queue, "active")).await?,
            TaskState::Archived => conn.zcard(self.queue_key(queue, "archived")).await?,
            TaskState::Completed => 0,
        };
        Ok(len)
    }

    /// Load the stored message for `id`
    pub async fn task(&self, id: Uuid) -> Result<Option<TaskMessage>, QueueError> {
        let mut conn = self.manager.clone();
        let body: Option<String> = conn.get(self.task_key(id)).await?;
        body.map(|b| serde_json::from_str(&b).map_err(QueueError::from))
            .transpose()
    }

    async fn settle(
        &self,
        msg: &TaskMessage,
        body: Option<&TaskMessage>,
        destination: &str,
        score: i64,
    ) -> Result<(), QueueError> {
        let body = match body {
            Some(updated) => serde_json::to_string(updated)?,
            None => String::new(),
        };
        let mut conn = self.manager.clone();
        let moved: i64 = self
            .settle_script
            .key(self.queue_key(msg.queue, "active"))
            .key(self.task_key(msg.id))
            .key(self.queue_key(msg.queue, destination))
            .arg(msg.id.to_string())
            .arg(body)
            .arg(score)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Redis settle failed for task {}: {}", msg.id, e);
                QueueError::from(e)
            })?;

        if moved == 0 {
            return Err(QueueError::TaskNotFound(format!(
                "task {} is not leased",
                msg.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, msg: TaskMessage) -> Result<TaskInfo, QueueError> {
        let now = Utc::now();
        let state = msg.initial_state(now);
        let body = serde_json::to_string(&msg)?;
        let id = msg.id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic().set(self.task_key(msg.id), body).ignore();
        match state {
            TaskState::Scheduled => {
                pipe.zadd(
                    self.queue_key(msg.queue, "scheduled"),
                    &id,
                    msg.not_before.timestamp_millis(),
                )
                .ignore();
            }
            _ => {
                pipe.lpush(self.queue_key(msg.queue, "pending"), &id).ignore();
            }
        }

        let mut conn = self.manager.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(|e| {
            error!("Redis enqueue failed for task {}: {}", msg.id, e);
            QueueError::from(e)
        })?;

        debug!(task_id = %msg.id, queue = %msg.queue, state = %state, "task stored");
        Ok(msg.info(state))
    }

    async fn dequeue(
        &self,
        queues: &[QueueClass],
        lease: Duration,
    ) -> Result<Option<TaskMessage>, QueueError> {
        let now = Utc::now();
        let deadline = lease_deadline(now, lease).timestamp_millis();
        let mut conn = self.manager.clone();

        for queue in queues {
            let body: Option<String> = self
                .dequeue_script
                .key(self.queue_key(*queue, "scheduled"))
                .key(self.queue_key(*queue, "pending"))
                .key(self.queue_key(*queue, "active"))
                .arg(now.timestamp_millis())
                .arg(deadline)
                .arg(self.task_key_prefix())
                .arg(BATCH)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| {
                    error!("Redis dequeue failed on queue {}: {}", queue, e);
                    QueueError::from(e)
                })?;

            if let Some(body) = body {
                return Ok(Some(serde_json::from_str(&body)?));
            }
        }
        Ok(None)
    }

    async fn complete(&self, msg: &TaskMessage) -> Result<(), QueueError> {
        self.settle(msg, None, "archived", 0).await
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut updated = msg.clone();
        updated.retry_count += 1;
        updated.not_before = process_at;
        updated.last_error = Some(error.to_string());
        self.settle(
            msg,
            Some(&updated),
            "scheduled",
            process_at.timestamp_millis(),
        )
        .await
    }

    async fn archive(&self, msg: &TaskMessage, error: &str) -> Result<(), QueueError> {
        let mut updated = msg.clone();
        updated.last_error = Some(error.to_string());
        self.settle(
            msg,
            Some(&updated),
            "archived",
            Utc::now().timestamp_millis(),
        )
        .await
    }

    async fn recover_expired_leases(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut conn = self.manager.clone();
        let mut recovered = 0usize;

        for queue in QueueClass::ALL {
            let settled: usize = self
                .recover_script
                .key(self.queue_key(queue, "active"))
                .key(self.queue_key(queue, "scheduled"))
                .key(self.queue_key(queue, "archived"))
                .arg(now.timestamp_millis())
                .arg(BATCH)
                .arg(self.task_key_prefix())
                .arg(now.to_rfc3339())
                .arg(LEASE_EXPIRED)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| {
                    error!("Redis lease recovery failed on queue {}: {}", queue, e);
                    QueueError::from(e)
                })?;
            recovered += settled;
        }
        Ok(recovered)
    }
}

