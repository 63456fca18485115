//! Cookie-bound sessions with signed ids and a pluggable store.
//!
//! Cookie value format: `<session-id>.<base64url(HMAC-SHA256(secret, id))>`.
//! Verification splits on the last `.` and compares in constant time; any
//! failure is treated as "no session".

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::SessionConfig;
use crate::cookie::SetCookie;
use crate::error::{Error, Result};
use crate::http::{RequestContext, Response};
use crate::pipeline::{ArcHandler, Middleware};

type HmacSha256 = Hmac<Sha256>;

pub type SessionData = serde_json::Map<String, serde_json::Value>;

const FLASH_PREFIX: &str = "_flash_";

/// Sign a session id: base64url(HMAC-SHA256(secret, id)).
pub fn sign(secret: &[u8], id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(id.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Constant-time signature verification.
pub fn verify(secret: &[u8], id: &str, sig: &str) -> bool {
    let Ok(given) = URL_SAFE_NO_PAD.decode(sig) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(id.as_bytes());
    let expected = mac.finalize().into_bytes();
    if given.len() != expected.len() {
        return false;
    }
    expected.as_slice().ct_eq(given.as_slice()).into()
}

/// Cookie value for a signed session id.
pub fn encode_signed(secret: &[u8], id: &str) -> String {
    format!("{id}.{}", sign(secret, id))
}

/// Split a cookie value on its last `.` and verify; `None` on any failure.
pub fn decode_signed(secret: &[u8], value: &str) -> Option<String> {
    let dot = value.rfind('.')?;
    let (id, sig) = (&value[..dot], &value[dot + 1..]);
    if id.is_empty() || sig.is_empty() {
        return None;
    }
    verify(secret, id, sig).then(|| id.to_string())
}

/// 16 cryptographically random bytes, base64url-rendered.
pub fn generate_id() -> String {
    let mut buf = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Pluggable session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<SessionData>>;
    async fn set(&self, id: &str, data: SessionData, max_age: Duration) -> Result<()>;
    async fn destroy(&self, id: &str) -> Result<()>;
    /// Refresh the entry's TTL without rewriting data.
    async fn touch(&self, id: &str, max_age: Duration) -> Result<()>;
    /// Evict expired entries. Backends with native TTLs keep the no-op
    /// default.
    fn sweep(&self, _now_ms: u64) {}
}

const SHARDS: usize = 16;

/// Default in-memory store with a periodic expiry sweep.
pub struct MemorySessionStore {
    shards: Vec<Mutex<HashMap<String, (SessionData, u64)>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: &str) -> &Mutex<HashMap<String, (SessionData, u64)>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<SessionData>> {
        let shard = self.shard(id).lock();
        Ok(shard.get(id).and_then(|(data, expires)| {
            (*expires > epoch_ms()).then(|| data.clone())
        }))
    }

    async fn set(&self, id: &str, data: SessionData, max_age: Duration) -> Result<()> {
        let expires = epoch_ms() + max_age.as_millis() as u64;
        self.shard(id).lock().insert(id.to_string(), (data, expires));
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        self.shard(id).lock().remove(id);
        Ok(())
    }

    async fn touch(&self, id: &str, max_age: Duration) -> Result<()> {
        let expires = epoch_ms() + max_age.as_millis() as u64;
        if let Some((_, e)) = self.shard(id).lock().get_mut(id) {
            *e = expires;
        }
        Ok(())
    }

    /// One short exclusive lock per shard.
    fn sweep(&self, now_ms: u64) {
        for shard in &self.shards {
            shard.lock().retain(|_, (_, expires)| *expires > now_ms);
        }
    }
}

struct SessionInner {
    id: String,
    /// Previous id after a regenerate; destroyed on save.
    prev_id: Option<String>,
    data: SessionData,
    is_new: bool,
    modified: bool,
    destroyed: bool,
    regenerated: bool,
}

/// Handle stored in the request context. Cloning shares the same state;
/// every mutation marks the session modified.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
}

impl Session {
    fn fresh() -> Self {
        Self::build(generate_id(), SessionData::new(), true)
    }

    fn resumed(id: String, data: SessionData) -> Self {
        Self::build(id, data, false)
    }

    fn build(id: String, data: SessionData, is_new: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                id,
                prev_id: None,
                data,
                is_new,
                modified: false,
                destroyed: false,
                regenerated: false,
            })),
        }
    }

    /// The session attached to this request, if session middleware ran.
    pub fn from_ctx(ctx: &RequestContext) -> Option<Session> {
        ctx.extensions.get::<Session>().cloned()
    }

    pub fn id(&self) -> String {
        self.inner.lock().id.clone()
    }

    pub fn is_new(&self) -> bool {
        self.inner.lock().is_new
    }

    pub fn is_modified(&self) -> bool {
        self.inner.lock().modified
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    pub fn was_regenerated(&self) -> bool {
        self.inner.lock().regenerated
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().data.get(key).cloned()
    }

    pub fn insert<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::Other(format!("unserializable session value: {e}")))?;
        let mut inner = self.inner.lock();
        inner.data.insert(key.to_string(), value);
        inner.modified = true;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock();
        let removed = inner.data.remove(key);
        if removed.is_some() {
            inner.modified = true;
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.modified = true;
    }

    /// Drop the session: store entry deleted, cookie expired.
    pub fn destroy(&self) {
        self.inner.lock().destroyed = true;
    }

    /// Allocate a new id, keep the data, schedule the old id for deletion.
    pub fn regenerate(&self) {
        let mut inner = self.inner.lock();
        let old = std::mem::replace(&mut inner.id, generate_id());
        if inner.prev_id.is_none() && !inner.is_new {
            inner.prev_id = Some(old);
        }
        inner.regenerated = true;
        inner.modified = true;
    }

    /// Append a flash value; it survives until the next read.
    pub fn flash<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::Other(format!("unserializable flash value: {e}")))?;
        let mut inner = self.inner.lock();
        let slot = inner
            .data
            .entry(format!("{FLASH_PREFIX}{key}"))
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let serde_json::Value::Array(arr) = slot {
            arr.push(value);
        } else {
            *slot = serde_json::Value::Array(vec![value]);
        }
        inner.modified = true;
        Ok(())
    }

    /// Read-and-delete the flash array for `key`.
    pub fn take_flash(&self, key: &str) -> Vec<serde_json::Value> {
        let mut inner = self.inner.lock();
        match inner.data.remove(&format!("{FLASH_PREFIX}{key}")) {
            Some(serde_json::Value::Array(arr)) => {
                inner.modified = true;
                arr
            }
            Some(other) => {
                inner.modified = true;
                vec![other]
            }
            None => Vec::new(),
        }
    }

    fn snapshot(&self) -> (String, Option<String>, SessionData, bool, bool, bool, bool) {
        let inner = self.inner.lock();
        (
            inner.id.clone(),
            inner.prev_id.clone(),
            inner.data.clone(),
            inner.is_new,
            inner.modified,
            inner.destroyed,
            inner.regenerated,
        )
    }
}

/// Session middleware: load on the way in, persist and emit cookies on the
/// way out.
pub struct SessionMiddleware {
    config: SessionConfig,
    secret: Arc<Vec<u8>>,
    store: Arc<dyn SessionStore>,
    sweeper: Arc<std::sync::OnceLock<()>>,
}

impl SessionMiddleware {
    pub fn new(config: SessionConfig) -> Self {
        let secret = Arc::new(config.secret.as_bytes().to_vec());
        Self {
            config,
            secret,
            store: Arc::new(MemorySessionStore::new()),
            sweeper: Arc::new(std::sync::OnceLock::new()),
        }
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Start the periodic expiry sweep once, on the first serving runtime.
    fn start_sweeper(store: &Arc<dyn SessionStore>, sweeper: &std::sync::OnceLock<()>) {
        sweeper.get_or_init(|| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    store.sweep(epoch_ms());
                }
            });
        });
    }
}

impl Middleware for SessionMiddleware {
    fn wrap(&self, inner: ArcHandler) -> ArcHandler {
        let config = Arc::new(self.config.clone());
        let secret = self.secret.clone();
        let store = self.store.clone();
        let sweeper = self.sweeper.clone();
        Arc::new(move |mut ctx: RequestContext| {
            let config = config.clone();
            let secret = secret.clone();
            let store = store.clone();
            let sweeper = sweeper.clone();
            let inner = inner.clone();
            async move {
                Self::start_sweeper(&store, &sweeper);
                let sid = ctx
                    .header("cookie")
                    .and_then(|h| crate::cookie::find(h, &config.cookie_name))
                    .and_then(|v| decode_signed(&secret, v));

                let session = match sid {
                    Some(id) => match store.get(&id).await {
                        Ok(Some(data)) => Session::resumed(id, data),
                        Ok(None) => Session::fresh(),
                        Err(e) => {
                            tracing::warn!("session store get failed: {e}");
                            Session::fresh()
                        }
                    },
                    None => Session::fresh(),
                };
                ctx.extensions.insert(session.clone());

                let mut res = inner.call(ctx).await?;

                let (id, prev_id, data, is_new, modified, destroyed, _regenerated) =
                    session.snapshot();
                let max_age = Duration::from_secs(config.max_age_secs);

                let cookie_for = |id: &str| {
                    SetCookie::new(&config.cookie_name, encode_signed(&secret, id))
                        .max_age(config.max_age_secs as i64)
                        .secure(config.secure)
                };

                if destroyed {
                    if let Some(prev) = &prev_id {
                        let _ = store.destroy(prev).await;
                    }
                    if let Err(e) = store.destroy(&id).await {
                        tracing::warn!("session store destroy failed: {e}");
                    }
                    res.headers.append(
                        "set-cookie",
                        SetCookie::expired(&config.cookie_name).secure(config.secure).encode(),
                    );
                } else if modified || (is_new && config.save_uninitialized) {
                    if let Some(prev) = &prev_id {
                        let _ = store.destroy(prev).await;
                    }
                    if let Err(e) = store.set(&id, data, max_age).await {
                        tracing::warn!("session store set failed: {e}");
                    }
                    res.headers.append("set-cookie", cookie_for(&id).encode());
                } else if !is_new {
                    if let Err(e) = store.touch(&id, max_age).await {
                        tracing::warn!("session store touch failed: {e}");
                    }
                    if config.rolling {
                        res.headers.append("set-cookie", cookie_for(&id).encode());
                    }
                }
                // New and untouched with save_uninitialized off: no store
                // write, no cookie.

                Ok(res)
            }
        })
    }
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    #[test]
    fn sign_verify_round_trip() {
        let id = generate_id();
        let sig = sign(SECRET, &id);
        assert!(verify(SECRET, &id, &sig));
        assert!(!verify(b"other-secret", &id, &sig));
        assert!(!verify(SECRET, "tampered-id", &sig));
        assert!(!verify(SECRET, &id, "not-base64!!"));
    }

    #[test]
    fn signed_cookie_round_trip() {
        let value = encode_signed(SECRET, "abc123");
        assert_eq!(decode_signed(SECRET, &value).as_deref(), Some("abc123"));
        assert!(decode_signed(b"wrong", &value).is_none());
        assert!(decode_signed(SECRET, "no-dot-here").is_none());
        assert!(decode_signed(SECRET, ".sigonly").is_none());
    }

    #[test]
    fn ids_are_unique_and_urlsafe() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 22); // 16 bytes, base64url, no padding
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn memory_store_ttl() {
        let store = MemorySessionStore::new();
        let mut data = SessionData::new();
        data.insert("k".into(), serde_json::json!(1));
        store.set("a", data, Duration::from_secs(60)).await.unwrap();
        assert!(store.get("a").await.unwrap().is_some());

        store.destroy("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_sweep() {
        let store = MemorySessionStore::new();
        store.set("soon", SessionData::new(), Duration::from_millis(1)).await.unwrap();
        store.set("later", SessionData::new(), Duration::from_secs(3600)).await.unwrap();
        store.sweep(epoch_ms() + 10_000);
        assert_eq!(store.len(), 1);
        assert!(store.get("later").await.unwrap().is_some());
    }

    #[test]
    fn mutation_tracking() {
        let s = Session::fresh();
        assert!(s.is_new());
        assert!(!s.is_modified());
        s.insert("user", "ada").unwrap();
        assert!(s.is_modified());
        assert_eq!(s.get("user"), Some(serde_json::json!("ada")));
        s.remove("user");
        assert!(s.get("user").is_none());
    }

    #[test]
    fn regenerate_preserves_data() {
        let s = Session::resumed("old-id".into(), SessionData::new());
        s.insert("cart", vec![1, 2, 3]).unwrap();
        let old = s.id();
        s.regenerate();
        assert_ne!(s.id(), old);
        assert!(s.was_regenerated());
        assert_eq!(s.get("cart"), Some(serde_json::json!([1, 2, 3])));
    }

    #[test]
    fn flash_appends_then_drains() {
        let s = Session::fresh();
        s.flash("notice", "saved").unwrap();
        s.flash("notice", "again").unwrap();
        let drained = s.take_flash("notice");
        assert_eq!(drained, vec![serde_json::json!("saved"), serde_json::json!("again")]);
        assert!(s.take_flash("notice").is_empty());
        // Stored under the reserved key prefix.
        s.flash("x", 1).unwrap();
        assert!(s.get("_flash_x").is_some());
    }

    mod middleware {
        use super::*;
        use crate::http::{Method, Response};
        use crate::pipeline::Handler;

        fn config() -> SessionConfig {
            SessionConfig {
                secret: "mw-secret".to_string(),
                ..Default::default()
            }
        }

        fn with_cookie(cookie: Option<&str>) -> RequestContext {
            let mut ctx = RequestContext::new(Method::Get, "/");
            if let Some(c) = cookie {
                ctx.headers.set("cookie", c);
            }
            ctx
        }

        fn session_cookie(res: &Response) -> Option<String> {
            res.headers
                .get_all("set-cookie")
                .find(|v| v.starts_with("sid="))
                .map(|v| {
                    let end = v.find(';').unwrap_or(v.len());
                    v[..end].to_string()
                })
        }

        fn writing_handler() -> ArcHandler {
            Arc::new(|ctx: RequestContext| async move {
                let session = Session::from_ctx(&ctx).expect("session middleware ran");
                session.insert("views", 1)?;
                Ok(Response::ok("ok"))
            })
        }

        fn reading_handler() -> ArcHandler {
            Arc::new(|ctx: RequestContext| async move {
                let session = Session::from_ctx(&ctx).expect("session middleware ran");
                let views = session.get("views").unwrap_or(serde_json::json!(0));
                Ok(Response::ok(views.to_string()))
            })
        }

        #[tokio::test]
        async fn write_then_resume() {
            let store = Arc::new(MemorySessionStore::new());
            let mw = SessionMiddleware::new(config()).store(store.clone());

            let res = mw.wrap(writing_handler()).call(with_cookie(None)).await.unwrap();
            let cookie = session_cookie(&res).expect("modified session emits a cookie");
            assert_eq!(store.len(), 1);

            let res = mw
                .wrap(reading_handler())
                .call(with_cookie(Some(&cookie)))
                .await
                .unwrap();
            assert_eq!(res.body.as_bytes(), b"1");
            // Untouched resumed session: no new cookie (rolling off).
            assert!(session_cookie(&res).is_none());
        }

        #[tokio::test]
        async fn untouched_new_session_writes_nothing() {
            let store = Arc::new(MemorySessionStore::new());
            let mw = SessionMiddleware::new(config()).store(store.clone());
            let passthrough: ArcHandler =
                Arc::new(|_ctx: RequestContext| async { Ok(Response::ok("hi")) });

            let res = mw.wrap(passthrough).call(with_cookie(None)).await.unwrap();
            assert!(session_cookie(&res).is_none());
            assert_eq!(store.len(), 0);
        }

        #[tokio::test]
        async fn tampered_cookie_treated_as_absent() {
            let store = Arc::new(MemorySessionStore::new());
            let mw = SessionMiddleware::new(config()).store(store.clone());

            let res = mw.wrap(writing_handler()).call(with_cookie(None)).await.unwrap();
            let cookie = session_cookie(&res).unwrap();
            let tampered = format!("{}x", cookie);

            let res = mw
                .wrap(reading_handler())
                .call(with_cookie(Some(&tampered)))
                .await
                .unwrap();
            // Fresh session: no stored views.
            assert_eq!(res.body.as_bytes(), b"0");
        }

        #[tokio::test]
        async fn destroy_emits_removal_cookie() {
            let store = Arc::new(MemorySessionStore::new());
            let mw = SessionMiddleware::new(config()).store(store.clone());

            let res = mw.wrap(writing_handler()).call(with_cookie(None)).await.unwrap();
            let cookie = session_cookie(&res).unwrap();

            let destroying: ArcHandler = Arc::new(|ctx: RequestContext| async move {
                Session::from_ctx(&ctx).unwrap().destroy();
                Ok(Response::ok("bye"))
            });
            let res = mw.wrap(destroying).call(with_cookie(Some(&cookie))).await.unwrap();
            let set = res.headers.get("set-cookie").unwrap();
            assert!(set.contains("Max-Age=0"));
            assert_eq!(store.len(), 0);
        }

        #[tokio::test]
        async fn regenerate_rotates_id_and_drops_old_entry() {
            let store = Arc::new(MemorySessionStore::new());
            let mw = SessionMiddleware::new(config()).store(store.clone());

            let res = mw.wrap(writing_handler()).call(with_cookie(None)).await.unwrap();
            let cookie = session_cookie(&res).unwrap();
            let old_id = decode_signed(b"mw-secret", cookie.strip_prefix("sid=").unwrap()).unwrap();

            let regen: ArcHandler = Arc::new(|ctx: RequestContext| async move {
                Session::from_ctx(&ctx).unwrap().regenerate();
                Ok(Response::ok("rotated"))
            });
            let res = mw.wrap(regen).call(with_cookie(Some(&cookie))).await.unwrap();
            let new_cookie = session_cookie(&res).unwrap();
            let new_id =
                decode_signed(b"mw-secret", new_cookie.strip_prefix("sid=").unwrap()).unwrap();
            assert_ne!(old_id, new_id);
            assert_eq!(store.len(), 1);
            assert!(store.get(&old_id).await.unwrap().is_none());
            assert!(store.get(&new_id).await.unwrap().is_some());
        }

        #[tokio::test]
        async fn rolling_refreshes_cookie_on_reads() {
            let store = Arc::new(MemorySessionStore::new());
            let mut cfg = config();
            cfg.rolling = true;
            let mw = SessionMiddleware::new(cfg).store(store.clone());

            let res = mw.wrap(writing_handler()).call(with_cookie(None)).await.unwrap();
            let cookie = session_cookie(&res).unwrap();

            let res = mw
                .wrap(reading_handler())
                .call(with_cookie(Some(&cookie)))
                .await
                .unwrap();
            assert!(session_cookie(&res).is_some());
        }

        #[tokio::test]
        async fn flash_survives_exactly_one_hop() {
            let store = Arc::new(MemorySessionStore::new());
            let mw = SessionMiddleware::new(config()).store(store.clone());

            let setter: ArcHandler = Arc::new(|ctx: RequestContext| async move {
                let s = Session::from_ctx(&ctx).unwrap();
                s.flash("notice", "created").unwrap();
                Ok(Response::ok("set"))
            });
            let res = mw.wrap(setter).call(with_cookie(None)).await.unwrap();
            let cookie = session_cookie(&res).unwrap();

            let taker: ArcHandler = Arc::new(|ctx: RequestContext| async move {
                let s = Session::from_ctx(&ctx).unwrap();
                let msgs = s.take_flash("notice");
                Ok(Response::ok(serde_json::to_string(&msgs).unwrap()))
            });
            let res = mw.wrap(taker.clone()).call(with_cookie(Some(&cookie))).await.unwrap();
            assert_eq!(res.body.as_bytes(), br#"["created"]"#);

            // Second read: gone.
            let res = mw.wrap(taker).call(with_cookie(Some(&cookie))).await.unwrap();
            assert_eq!(res.body.as_bytes(), b"[]");
        }
    }
}
