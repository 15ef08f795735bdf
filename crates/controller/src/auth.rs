use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng as SaltRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use netwatch_protocol::{Agent, Role, Session, ShareLink, SiteRole, User};

use crate::error::Error;
use crate::store::IdentityStore;

/// JWT claims for bearer tokens. The subject is the session id; the session
/// row is always re-checked after signature validation so revocation takes
/// effect ahead of token expiry.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (session id)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    pub iat: u64,
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
/// Returns true only if both slices have equal length and identical contents.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a random hex secret of `bytes` entropy bytes.
pub fn generate_secret(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Hash a password or PSK with Argon2 and a fresh per-credential salt.
pub fn hash_secret(secret: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Transient(format!("kdf failure: {e}")))
}

/// Verify a secret against a stored Argon2 digest.
pub fn verify_secret(hash: &str, secret: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Peppered digest for bootstrap PINs: SHA-256 over pepper then pin.
/// PINs are single-use; the pepper comes from `PIN_PEPPER`.
pub fn hash_pin(pepper: &str, pin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(pin.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct AuthService {
    store: Arc<dyn IdentityStore>,
    key: String,
    pin_pepper: String,
    session_ttl: Duration,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        key: String,
        pin_pepper: String,
        session_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            key,
            pin_pepper,
            session_ttl: Duration::seconds(session_ttl_secs as i64),
        }
    }

    pub fn pin_digest(&self, pin: &str) -> String {
        hash_pin(&self.pin_pepper, pin)
    }

    /// Authenticate a user by email + password and open a session.
    ///
    /// Every failure path reports `InvalidCredentials` so the endpoint cannot
    /// be used as an account oracle.
    pub async fn login_user(
        &self,
        email: &str,
        password: &str,
        ip: &str,
    ) -> Result<(String, User), Error> {
        let user = self.store.user_by_email(email).await?;

        let user = match user {
            Some(user) if verify_secret(&user.password_hash, password) => user,
            Some(_) => return Err(Error::InvalidCredentials),
            None => {
                // Burn an equivalent KDF round so a missing account is not
                // distinguishable by response time.
                let _ = hash_secret(password);
                return Err(Error::InvalidCredentials);
            }
        };

        let session = self.open_session(user.id, false, None, ip).await?;
        let token = self.issue_token(&session)?;
        tracing::info!(target: "audit", event = "login_success", user_id = user.id, "User logged in");
        Ok((token, user))
    }

    /// One-shot PIN bootstrap: verifies the PIN, mints the agent's PSK, and
    /// invalidates the PIN. The plaintext PSK is returned exactly once.
    pub async fn agent_bootstrap(
        &self,
        agent_id: i64,
        pin: &str,
        client_ip: &str,
    ) -> Result<(String, Agent), Error> {
        let agent = self
            .store
            .agent_by_id(agent_id)
            .await?
            .ok_or(Error::InvalidCredentials)?;
        let pin_row = self
            .store
            .pin_for_agent(agent_id)
            .await?
            .ok_or(Error::InvalidCredentials)?;

        if pin_row.consumed {
            tracing::warn!(target: "audit", event = "bootstrap_replay", agent_id, %client_ip, "Consumed PIN replayed");
            return Err(Error::AlreadyClaimed);
        }
        let digest = self.pin_digest(pin);
        if !constant_time_eq(digest.as_bytes(), pin_row.pin_hash.as_bytes()) {
            tracing::warn!(target: "audit", event = "bootstrap_failure", agent_id, %client_ip, "PIN mismatch");
            return Err(Error::InvalidCredentials);
        }

        let psk = generate_secret(32);
        let psk_hash = hash_secret(&psk)?;
        self.store.set_agent_psk_hash(agent_id, &psk_hash).await?;
        // Consume last: a lost race here surfaces as AlreadyClaimed rather
        // than leaving a claimable PIN behind a stored PSK.
        self.store
            .consume_pin(agent_id)
            .await
            .map_err(|_| Error::AlreadyClaimed)?;

        tracing::info!(target: "audit", event = "bootstrap_success", agent_id, %client_ip, "Agent claimed");
        Ok((psk, agent))
    }

    /// Authenticate an agent by PSK on (re)connect and open an agent session.
    pub async fn agent_authenticate(
        &self,
        agent_id: i64,
        psk: &str,
        ip: &str,
    ) -> Result<(Session, Agent), Error> {
        let agent = self
            .store
            .agent_by_id(agent_id)
            .await?
            .ok_or(Error::InvalidCredentials)?;
        let hash = agent.psk_hash.as_deref().ok_or(Error::InvalidCredentials)?;
        if !verify_secret(hash, psk) {
            tracing::warn!(target: "audit", event = "agent_auth_failure", agent_id, %ip, "PSK mismatch");
            return Err(Error::InvalidCredentials);
        }
        let session = self.open_session(agent_id, true, None, ip).await?;
        Ok((session, agent))
    }

    /// Mint a share-scoped session for an already-resolved share link.
    pub async fn share_session(&self, link: &ShareLink, ip: &str) -> Result<(String, Session), Error> {
        let session = self.open_session(0, false, Some(link.id), ip).await?;
        let token = self.issue_token(&session)?;
        Ok((token, session))
    }

    async fn open_session(
        &self,
        item_id: i64,
        is_agent: bool,
        share_link_id: Option<i64>,
        ip: &str,
    ) -> Result<Session, Error> {
        let now = Utc::now();
        let session = Session {
            id: 0,
            item_id,
            is_agent,
            share_link_id,
            created: now,
            expiry: now + self.session_ttl,
            ws_connection_id: None,
            ip: ip.to_string(),
        };
        Ok(self.store.insert_session(session).await?)
    }

    /// Sign a bearer token for a session.
    pub fn issue_token(&self, session: &Session) -> Result<String, Error> {
        let claims = Claims {
            sub: session.id.to_string(),
            iat: Utc::now().timestamp() as u64,
            exp: session.expiry.timestamp() as u64,
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.key.as_bytes()),
        )
        .map_err(|e| Error::Transient(format!("token encode failure: {e}")))
    }

    /// Resolve a bearer token to its live session, extending the TTL on use.
    pub async fn resolve_token(&self, bearer: &str) -> Result<Session, Error> {
        let validation = Validation::new(Algorithm::HS256);
        let data: TokenData<Claims> = jsonwebtoken::decode(
            bearer,
            &DecodingKey::from_secret(self.key.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Error::TokenExpired,
            _ => Error::TokenInvalid,
        })?;

        let session_id: i64 = data.claims.sub.parse().map_err(|_| Error::TokenInvalid)?;
        let session = self
            .store
            .session_by_id(session_id)
            .await?
            .ok_or(Error::TokenInvalid)?;

        let now = Utc::now();
        if session.is_expired(now) {
            return Err(Error::TokenExpired);
        }

        // Implicit renewal; failure to extend never fails the request.
        if let Err(e) = self
            .store
            .extend_session(session.id, now + self.session_ttl)
            .await
        {
            tracing::warn!(session_id = session.id, "Failed to extend session: {e}");
        }

        Ok(session)
    }

    pub async fn logout(&self, session: &Session) -> Result<(), Error> {
        self.store.delete_session(session.id).await?;
        Ok(())
    }

    /// Enforce a minimum workspace role for a user session.
    /// Role order VIEWER < USER < ADMIN < OWNER; SITE_ADMIN bypasses.
    pub async fn assert_workspace_role(
        &self,
        session: &Session,
        workspace_id: i64,
        min_role: Role,
    ) -> Result<(), Error> {
        if session.is_agent || session.share_link_id.is_some() {
            return Err(Error::Forbidden);
        }
        let user = self
            .store
            .user_by_id(session.item_id)
            .await?
            .ok_or(Error::Forbidden)?;
        if user.role == SiteRole::SiteAdmin {
            return Ok(());
        }
        match self.store.workspace_role(workspace_id, user.id).await? {
            Some(role) if role >= min_role => Ok(()),
            _ => Err(Error::Forbidden),
        }
    }

    /// Resolve a share token, enforcing expiry and the password gate.
    pub async fn resolve_share_token(
        &self,
        token: &str,
        password: Option<&str>,
    ) -> Result<ShareLink, Error> {
        let link = self
            .store
            .share_link_by_token(token)
            .await?
            .ok_or(Error::NotFound("share link"))?;

        if link.is_expired(Utc::now()) {
            return Err(Error::LinkExpired);
        }
        if let Some(hash) = &link.password_hash {
            let password = password.ok_or(Error::PasswordRequired)?;
            if !verify_secret(hash, password) {
                return Err(Error::InvalidPassword);
            }
        }
        Ok(link)
    }

    /// Re-check that a share link still exists and has not expired. Used by
    /// the broadcast hub's revalidation window.
    pub async fn share_link_still_valid(&self, link_id: i64) -> Result<bool, Error> {
        match self.store.share_link_by_id(link_id).await? {
            Some(link) => Ok(!link.is_expired(Utc::now())),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryIdentityStore;
    use netwatch_protocol::{AgentPin, Workspace, WorkspaceMember};

    fn service(store: Arc<dyn IdentityStore>) -> AuthService {
        AuthService::new(store, "test-signing-key".into(), "test-pepper".into(), 3600)
    }

    async fn seed_agent(store: &MemoryIdentityStore, id: i64, pin: &str, pepper: &str) {
        store
            .insert_agent(Agent {
                id,
                workspace_id: 1,
                name: format!("agent-{id}"),
                psk_hash: None,
                public_ip_override: None,
                last_seen_at: None,
                version: None,
            })
            .await
            .unwrap();
        store
            .insert_pin(AgentPin {
                agent_id: id,
                pin_hash: hash_pin(pepper, pin),
                consumed: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn seed_user(store: &MemoryIdentityStore, email: &str, password: &str) -> User {
        store
            .insert_user(User {
                id: 0,
                email: email.into(),
                password_hash: hash_secret(password).unwrap(),
                role: SiteRole::User,
                verified: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(!constant_time_eq(b"", b"a"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn generated_secret_is_hex_and_unique() {
        let s1 = generate_secret(32);
        let s2 = generate_secret(32);
        assert_eq!(s1.len(), 64);
        assert!(s1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(s1, s2);
    }

    #[test]
    fn secret_hash_verifies() {
        let hash = hash_secret("hunter2").unwrap();
        assert!(verify_secret(&hash, "hunter2"));
        assert!(!verify_secret(&hash, "hunter3"));
        assert!(!verify_secret("not-a-hash", "hunter2"));
    }

    #[tokio::test]
    async fn bootstrap_pin_is_single_use() {
        let store = Arc::new(MemoryIdentityStore::new());
        seed_agent(&store, 42, "036977322", "test-pepper").await;
        let auth = service(store.clone());

        let (psk, agent) = auth
            .agent_bootstrap(42, "036977322", "203.0.113.5")
            .await
            .unwrap();
        assert_eq!(agent.id, 42);
        assert_eq!(psk.len(), 64);

        // Same PIN again: claimed, not invalid
        let err = auth
            .agent_bootstrap(42, "036977322", "203.0.113.5")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyClaimed));
    }

    #[tokio::test]
    async fn bootstrap_wrong_pin_is_invalid_credentials() {
        let store = Arc::new(MemoryIdentityStore::new());
        seed_agent(&store, 42, "036977322", "test-pepper").await;
        let auth = service(store);

        let err = auth
            .agent_bootstrap(42, "000000000", "203.0.113.5")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[tokio::test]
    async fn psk_authenticates_after_bootstrap() {
        let store = Arc::new(MemoryIdentityStore::new());
        seed_agent(&store, 42, "036977322", "test-pepper").await;
        let auth = service(store.clone());

        let (psk, _) = auth
            .agent_bootstrap(42, "036977322", "203.0.113.5")
            .await
            .unwrap();
        let (session, agent) = auth
            .agent_authenticate(42, &psk, "203.0.113.5")
            .await
            .unwrap();
        assert!(session.is_agent);
        assert_eq!(session.item_id, 42);
        assert_eq!(agent.id, 42);

        let err = auth
            .agent_authenticate(42, "deadbeef", "203.0.113.5")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[tokio::test]
    async fn login_token_resolves_to_session() {
        let store = Arc::new(MemoryIdentityStore::new());
        let user = seed_user(&store, "ops@example.com", "correct horse").await;
        let auth = service(store);

        let (token, logged_in) = auth
            .login_user("OPS@example.com", "correct horse", "198.51.100.1")
            .await
            .unwrap();
        assert_eq!(logged_in.id, user.id);

        let session = auth.resolve_token(&token).await.unwrap();
        assert_eq!(session.item_id, user.id);
        assert!(!session.is_agent);
    }

    #[tokio::test]
    async fn login_failures_are_uniform() {
        let store = Arc::new(MemoryIdentityStore::new());
        seed_user(&store, "ops@example.com", "correct horse").await;
        let auth = service(store);

        let wrong_password = auth
            .login_user("ops@example.com", "wrong", "198.51.100.1")
            .await
            .unwrap_err();
        let no_such_user = auth
            .login_user("nobody@example.com", "wrong", "198.51.100.1")
            .await
            .unwrap_err();
        assert!(matches!(wrong_password, Error::InvalidCredentials));
        assert!(matches!(no_such_user, Error::InvalidCredentials));
    }

    #[tokio::test]
    async fn resolve_token_rejects_garbage_and_foreign_signature() {
        let store = Arc::new(MemoryIdentityStore::new());
        let auth = service(store.clone());
        assert!(matches!(
            auth.resolve_token("not.a.token").await.unwrap_err(),
            Error::TokenInvalid
        ));

        let other = AuthService::new(store, "other-key".into(), "p".into(), 3600);
        let session = other.open_session(1, false, None, "127.0.0.1").await.unwrap();
        let foreign = other.issue_token(&session).unwrap();
        assert!(matches!(
            auth.resolve_token(&foreign).await.unwrap_err(),
            Error::TokenInvalid
        ));
    }

    #[tokio::test]
    async fn workspace_role_enforcement() {
        let store = Arc::new(MemoryIdentityStore::new());
        let viewer = seed_user(&store, "viewer@example.com", "pw").await;
        store
            .insert_workspace(Workspace {
                id: 7,
                name: "noc".into(),
                owner_user_id: viewer.id,
            })
            .await
            .unwrap();
        store
            .insert_member(WorkspaceMember {
                workspace_id: 7,
                user_id: viewer.id,
                role: Role::Viewer,
            })
            .await
            .unwrap();
        let auth = service(store.clone());

        let (token, _) = auth
            .login_user("viewer@example.com", "pw", "127.0.0.1")
            .await
            .unwrap();
        let session = auth.resolve_token(&token).await.unwrap();

        assert!(auth
            .assert_workspace_role(&session, 7, Role::Viewer)
            .await
            .is_ok());
        assert!(matches!(
            auth.assert_workspace_role(&session, 7, Role::User)
                .await
                .unwrap_err(),
            Error::Forbidden
        ));
        // Not a member of workspace 8 at all
        assert!(matches!(
            auth.assert_workspace_role(&session, 8, Role::Viewer)
                .await
                .unwrap_err(),
            Error::Forbidden
        ));
    }

    #[tokio::test]
    async fn site_admin_bypasses_workspace_checks() {
        let store = Arc::new(MemoryIdentityStore::new());
        let admin = store
            .insert_user(User {
                id: 0,
                email: "root@example.com".into(),
                password_hash: hash_secret("pw").unwrap(),
                role: SiteRole::SiteAdmin,
                verified: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let auth = service(store);
        let session = auth
            .open_session(admin.id, false, None, "127.0.0.1")
            .await
            .unwrap();
        assert!(auth
            .assert_workspace_role(&session, 999, Role::Owner)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn share_token_password_gate() {
        let store = Arc::new(MemoryIdentityStore::new());
        store
            .insert_share_link(ShareLink {
                id: 0,
                token: "shr_abcdef".into(),
                workspace_id: 1,
                agent_id: Some(2),
                probe_id: None,
                password_hash: Some(hash_secret("open sesame").unwrap()),
                expires_at: None,
                allow_speedtest: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let auth = service(store);

        assert!(matches!(
            auth.resolve_share_token("shr_abcdef", None).await.unwrap_err(),
            Error::PasswordRequired
        ));
        assert!(matches!(
            auth.resolve_share_token("shr_abcdef", Some("wrong"))
                .await
                .unwrap_err(),
            Error::InvalidPassword
        ));
        let link = auth
            .resolve_share_token("shr_abcdef", Some("open sesame"))
            .await
            .unwrap();
        assert!(link.allow_speedtest);
        assert!(matches!(
            auth.resolve_share_token("shr_missing", None).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn expired_share_link_is_rejected_and_revalidation_notices_deletes() {
        let store = Arc::new(MemoryIdentityStore::new());
        let expired = store
            .insert_share_link(ShareLink {
                id: 0,
                token: "shr_old".into(),
                workspace_id: 1,
                agent_id: None,
                probe_id: None,
                password_hash: None,
                expires_at: Some(Utc::now() - Duration::minutes(1)),
                allow_speedtest: false,
                created_at: Utc::now() - Duration::hours(1),
            })
            .await
            .unwrap();
        let live = store
            .insert_share_link(ShareLink {
                id: 0,
                token: "shr_live".into(),
                workspace_id: 1,
                agent_id: None,
                probe_id: None,
                password_hash: None,
                expires_at: None,
                allow_speedtest: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let auth = service(store.clone());

        assert!(matches!(
            auth.resolve_share_token("shr_old", None).await.unwrap_err(),
            Error::LinkExpired
        ));
        assert!(!auth.share_link_still_valid(expired.id).await.unwrap());
        assert!(auth.share_link_still_valid(live.id).await.unwrap());

        store.delete_share_link(live.id).await.unwrap();
        assert!(!auth.share_link_still_valid(live.id).await.unwrap());
    }
}
