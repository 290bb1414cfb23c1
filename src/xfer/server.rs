//! Server side of a sync exchange.
//!
//! One request batch in, one reply batch out, inside one store transaction.
//! Nothing carries over between requests except what is in the store.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::store::{mint_code, ArtifactStore};
use crate::xfer::auth::{Capabilities, UserTable};
use crate::xfer::cluster;
use crate::xfer::codec::{BatchReader, Message};
use crate::xfer::session::{Session, XferStats};
use bytes::Bytes;

/// What one request produced
#[derive(Debug, Clone)]
pub struct Reply {
    pub body: Bytes,
    pub stats: XferStats,
    /// Text of the `error` that aborted the batch, if any
    pub error: Option<String>,
}

/// A repository serving sync requests.
pub struct Server<S> {
    store: S,
    config: SyncConfig,
    users: UserTable,
}

impl<S: ArtifactStore> Server<S> {
    pub fn new(store: S, config: SyncConfig) -> Self {
        let users = UserTable::from_config(&config.users);
        Self {
            store,
            config,
            users,
        }
    }

    pub fn with_users(store: S, config: SyncConfig, users: UserTable) -> Self {
        Self {
            store,
            config,
            users,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Process one request batch.
    pub fn handle(&mut self, request: &[u8]) -> Result<Reply> {
        self.store.begin();
        match process(&mut self.store, &self.config, &self.users, request) {
            Ok(reply) => {
                // Committed even when the batch was aborted: every artifact
                // already accepted passed its hash check.
                self.store.commit();
                Ok(reply)
            }
            Err(e) => {
                self.store.rollback();
                Err(e)
            }
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Permissions accumulated while reading one batch.
#[derive(Debug, Default)]
struct Grants {
    caps: Capabilities,
    pull: bool,
    push: bool,
}

enum Flow {
    Continue,
    Abort(String),
}

/// Process `request` against `store` and build the reply.
pub fn process<S: ArtifactStore + ?Sized>(
    store: &mut S,
    config: &SyncConfig,
    users: &UserTable,
    request: &[u8],
) -> Result<Reply> {
    let mut session = Session::new(config.max_download, config.delta_margin);
    let mut grants = Grants {
        caps: users.nobody(),
        ..Default::default()
    };
    let mut reader = BatchReader::new(request);
    let mut error = None;

    while let Some((line, parsed)) = reader.next_message() {
        let flow = match parsed {
            Ok(message) => {
                tracing::debug!("recv {}", line.tokens.join(" "));
                let rest = reader.remaining();
                dispatch(store, users, &mut session, &mut grants, message, rest)?
            }
            Err(e) => Flow::Abort(e.to_string()),
        };
        if let Flow::Abort(text) = flow {
            tracing::warn!("aborting batch: {}", text);
            session.emit(&Message::Error(text.clone()));
            error = Some(text);
            break;
        }
    }

    if error.is_none() {
        if grants.push {
            for id in store
                .phantoms()
                .into_iter()
                .take(config.server_phantom_limit)
            {
                session.send_gimme(&*store, &id);
            }
        }
        if grants.pull {
            cluster::maybe_create(store, config.cluster_threshold)?;
            for id in store.unclustered() {
                if !store.is_phantom(&id) {
                    session.send_igot(&*store, &id);
                }
            }
        }
        session.emit(&Message::Cookie(mint_code()));
    }

    let stats = session.stats;
    tracing::info!(
        "exchange done: recv {} sent {} igot {} gimme {} dangling {}",
        stats.received(),
        stats.sent(),
        stats.igot_sent,
        stats.gimme_sent,
        stats.dangling
    );
    Ok(Reply {
        body: session.take_output(),
        stats,
        error,
    })
}

fn dispatch<S: ArtifactStore + ?Sized>(
    store: &mut S,
    users: &UserTable,
    session: &mut Session,
    grants: &mut Grants,
    message: Message,
    rest: &[u8],
) -> Result<Flow> {
    match message {
        Message::Login {
            user,
            nonce,
            signature,
        } => match users.verify(&user, &nonce, &signature, rest) {
            Some(caps) => {
                tracing::info!("login {} granted {}", user, caps.to_letters());
                grants.caps |= caps;
            }
            None => tracing::warn!("login failed for {}", user),
        },

        Message::Pull {
            server_code,
            project_code,
        } => {
            if let Some(reason) = check_codes(&*store, &server_code, &project_code) {
                return Ok(Flow::Abort(reason));
            }
            if !grants.caps.contains(Capabilities::READ) {
                return Ok(Flow::Abort("not authorized to read".to_string()));
            }
            grants.pull = true;
        }

        Message::Push {
            server_code,
            project_code,
        } => {
            if let Some(reason) = check_codes(&*store, &server_code, &project_code) {
                return Ok(Flow::Abort(reason));
            }
            if !grants.caps.contains(Capabilities::WRITE) {
                if grants.pull {
                    session.emit(&Message::Message(
                        "pull only - not authorized to push".to_string(),
                    ));
                    return Ok(Flow::Continue);
                }
                return Ok(Flow::Abort("not authorized to write".to_string()));
            }
            grants.push = true;
        }

        Message::Clone => {
            if !grants.caps.contains(Capabilities::CLONE) {
                return Ok(Flow::Abort("not authorized to clone".to_string()));
            }
            grants.pull = true;
            session.set_native_only();
            session.emit(&Message::Push {
                server_code: store.server_code().to_string(),
                project_code: store.project_code().to_string(),
            });
        }

        Message::Gimme(id) => {
            session.stats.gimme_received += 1;
            if grants.pull {
                session.send_file(store, &id)?;
            }
        }

        Message::Igot(id) => {
            session.stats.igot_received += 1;
            if grants.push {
                session.note_remote_has(&id);
                if store.new_phantom(&id) {
                    session.stats.new_phantoms += 1;
                }
            }
        }

        Message::File {
            id,
            delta_source,
            content,
        } => {
            if !grants.push {
                return Ok(Flow::Abort("not authorized to write".to_string()));
            }
            match session.accept_file(store, &id, delta_source.as_ref(), content) {
                Ok(_) => {}
                Err(SyncError::Integrity { .. }) => {
                    return Ok(Flow::Abort("content does not match sha1 hash".to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        Message::Cookie(text) => {
            session.cookie = Some(text);
        }

        Message::Error(text) => {
            tracing::warn!("client reported error: {}", text);
            return Ok(Flow::Abort(format!("client error: {}", text)));
        }

        Message::Message(text) => {
            return Ok(Flow::Abort(format!("bad command: message {}", text)));
        }
    }
    Ok(Flow::Continue)
}

/// Reason to refuse a pull/push line naming these codes.
fn check_codes<S: ArtifactStore + ?Sized>(
    store: &S,
    server_code: &str,
    project_code: &str,
) -> Option<String> {
    if server_code == store.server_code() {
        return Some("server loop".to_string());
    }
    if project_code != store.project_code() {
        return Some("wrong project".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ArtifactId;
    use crate::store::{MemoryStore, Origin};
    use crate::xfer::auth::login_message;
    use bytes::BytesMut;

    fn server() -> Server<MemoryStore> {
        let mut users = UserTable::new();
        users.insert("reader", "rpass", Capabilities::READ);
        users.insert(
            "writer",
            "wpass",
            Capabilities::READ | Capabilities::WRITE,
        );
        users.insert("cloner", "cpass", Capabilities::READ | Capabilities::CLONE);
        users.insert("pusher", "ppass", Capabilities::WRITE);
        Server::with_users(MemoryStore::new_project(), SyncConfig::default(), users)
    }

    fn batch(messages: &[Message]) -> BytesMut {
        let mut out = BytesMut::new();
        for m in messages {
            m.encode(&mut out);
        }
        out
    }

    /// Prepend a login line signing `body`.
    fn signed(user: &str, password: &str, body: &[u8]) -> Vec<u8> {
        let mut out = login_message(user, password, body).to_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn replies(reply: &Reply) -> Vec<Message> {
        let mut reader = BatchReader::new(&reply.body);
        let mut out = Vec::new();
        while let Some((_, m)) = reader.next_message() {
            out.push(m.unwrap());
        }
        out
    }

    fn pull(srv: &Server<MemoryStore>) -> Message {
        Message::Pull {
            server_code: "client".to_string(),
            project_code: srv.store().project_code().to_string(),
        }
    }

    fn push(srv: &Server<MemoryStore>) -> Message {
        Message::Push {
            server_code: "client".to_string(),
            project_code: srv.store().project_code().to_string(),
        }
    }

    fn file(content: &'static [u8]) -> Message {
        Message::File {
            id: ArtifactId::of(content),
            delta_source: None,
            content: Bytes::from_static(content),
        }
    }

    #[test]
    fn test_server_loop_guard() {
        let mut srv = server();
        let body = batch(&[Message::Pull {
            server_code: srv.store().server_code().to_string(),
            project_code: srv.store().project_code().to_string(),
        }]);
        let reply = srv.handle(&signed("writer", "wpass", &body)).unwrap();
        assert_eq!(reply.error.as_deref(), Some("server loop"));
        assert_eq!(replies(&reply), vec![Message::Error("server loop".to_string())]);
    }

    #[test]
    fn test_wrong_project() {
        let mut srv = server();
        let body = batch(&[Message::Push {
            server_code: "client".to_string(),
            project_code: "elsewhere".to_string(),
        }]);
        let reply = srv.handle(&signed("writer", "wpass", &body)).unwrap();
        assert_eq!(reply.error.as_deref(), Some("wrong project"));
    }

    #[test]
    fn test_pull_without_login_denied() {
        let mut srv = server();
        let reply = srv.handle(&batch(&[pull(&srv)])).unwrap();
        assert_eq!(reply.error.as_deref(), Some("not authorized to read"));
    }

    #[test]
    fn test_failed_login_grants_nothing() {
        let mut srv = server();
        let body = batch(&[push(&srv), file(b"sneaky")]);
        let reply = srv.handle(&signed("writer", "wrong", &body)).unwrap();
        assert_eq!(reply.error.as_deref(), Some("not authorized to write"));
        assert_eq!(srv.store().artifact_count(), 0);
    }

    #[test]
    fn test_push_degrades_after_pull() {
        let mut srv = server();
        let body = batch(&[pull(&srv), push(&srv)]);
        let reply = srv.handle(&signed("reader", "rpass", &body)).unwrap();
        assert!(reply.error.is_none());
        assert!(replies(&reply)
            .contains(&Message::Message("pull only - not authorized to push".to_string())));
    }

    #[test]
    fn test_logins_accumulate_capabilities() {
        let mut srv = server();
        // Neither user alone may both pull and push
        let body = batch(&[pull(&srv), push(&srv), file(b"two keys")]);
        let inner = signed("pusher", "ppass", &body);
        let outer = signed("reader", "rpass", &inner);
        let reply = srv.handle(&outer).unwrap();

        assert!(reply.error.is_none());
        assert!(!replies(&reply)
            .contains(&Message::Message("pull only - not authorized to push".to_string())));
        assert!(srv.store().is_available(&ArtifactId::of(b"two keys")));
    }

    #[test]
    fn test_push_before_pull_is_fatal() {
        let mut srv = server();
        let body = batch(&[push(&srv), pull(&srv)]);
        let reply = srv.handle(&signed("reader", "rpass", &body)).unwrap();
        assert_eq!(reply.error.as_deref(), Some("not authorized to write"));
    }

    #[test]
    fn test_push_accepts_file_and_requests_phantoms() {
        let mut srv = server();
        let wanted = ArtifactId::of(b"client has this too");
        let body = batch(&[push(&srv), file(b"pushed content"), Message::Igot(wanted.clone())]);
        let reply = srv.handle(&signed("writer", "wpass", &body)).unwrap();

        assert!(reply.error.is_none());
        assert_eq!(reply.stats.files_received, 1);
        assert!(srv.store().is_available(&ArtifactId::of(b"pushed content")));
        assert!(srv.store().unsent().is_empty());
        assert!(replies(&reply).contains(&Message::Gimme(wanted)));
    }

    #[test]
    fn test_igot_is_idempotent() {
        let mut srv = server();
        let id = ArtifactId::of(b"advertised");
        let body = batch(&[push(&srv), Message::Igot(id.clone()), Message::Igot(id.clone())]);
        let reply = srv.handle(&signed("writer", "wpass", &body)).unwrap();

        assert_eq!(reply.stats.new_phantoms, 1);
        assert_eq!(srv.store().phantoms(), vec![id.clone()]);
        let gimmes = replies(&reply)
            .into_iter()
            .filter(|m| *m == Message::Gimme(id.clone()))
            .count();
        assert_eq!(gimmes, 1);
    }

    #[test]
    fn test_hash_mismatch_aborts() {
        let mut srv = server();
        let body = batch(&[
            push(&srv),
            Message::File {
                id: ArtifactId::of(b"claimed"),
                delta_source: None,
                content: Bytes::from_static(b"actual"),
            },
            file(b"never reached"),
        ]);
        let reply = srv.handle(&signed("writer", "wpass", &body)).unwrap();
        assert_eq!(reply.error.as_deref(), Some("content does not match sha1 hash"));
        assert_eq!(srv.store().artifact_count(), 0);
    }

    #[test]
    fn test_malformed_file_line_no_mutation() {
        for bad in [
            "file {id} abc\nxyz".to_string(),
            "file {id} -3\nxyz".to_string(),
            "file notanid 3\nxyz".to_string(),
        ] {
            let mut srv = server();
            let mut body = batch(&[push(&srv)]).to_vec();
            body.extend_from_slice(
                bad.replace("{id}", ArtifactId::of(b"xyz").as_str()).as_bytes(),
            );
            let reply = srv.handle(&signed("writer", "wpass", &body)).unwrap();
            assert_eq!(reply.error.as_deref(), Some("malformed file line"));
            assert_eq!(srv.store().artifact_count(), 0);
            assert!(srv.store().phantoms().is_empty());
        }
    }

    #[test]
    fn test_bad_command() {
        let mut srv = server();
        let reply = srv.handle(b"frobnicate now\n").unwrap();
        assert_eq!(reply.error.as_deref(), Some("bad command: frobnicate now"));
    }

    #[test]
    fn test_gimme_ignored_without_pull_and_for_unknown() {
        let mut srv = server();
        let id = srv
            .store_mut()
            .put(Bytes::from("server data"), Origin::Local)
            .unwrap();

        let reply = srv.handle(&batch(&[Message::Gimme(id.clone())])).unwrap();
        assert_eq!(reply.stats.sent(), 0);

        let body = batch(&[
            pull(&srv),
            Message::Gimme(ArtifactId::of(b"nobody has this")),
            Message::Gimme(id),
        ]);
        let reply = srv.handle(&signed("reader", "rpass", &body)).unwrap();
        assert!(reply.error.is_none());
        assert_eq!(reply.stats.files_sent, 1);
    }

    #[test]
    fn test_clone_announces_identity() {
        let mut srv = server();
        let reply = srv
            .handle(&signed("cloner", "cpass", &batch(&[Message::Clone])))
            .unwrap();
        let expected = Message::Push {
            server_code: srv.store().server_code().to_string(),
            project_code: srv.store().project_code().to_string(),
        };
        assert_eq!(replies(&reply)[0], expected);
    }

    #[test]
    fn test_clone_requires_capability() {
        let mut srv = server();
        let reply = srv
            .handle(&signed("reader", "rpass", &batch(&[Message::Clone])))
            .unwrap();
        assert_eq!(reply.error.as_deref(), Some("not authorized to clone"));
    }

    #[test]
    fn test_pull_advertises_unclustered() {
        let mut srv = server();
        let a = srv.store_mut().put(Bytes::from("a"), Origin::Local).unwrap();
        let b = srv.store_mut().put(Bytes::from("b"), Origin::Local).unwrap();

        let reply = srv
            .handle(&signed("reader", "rpass", &batch(&[pull(&srv)])))
            .unwrap();
        let got = replies(&reply);
        assert!(got.contains(&Message::Igot(a)));
        assert!(got.contains(&Message::Igot(b)));
        assert!(matches!(got.last(), Some(Message::Cookie(_))));
    }

    #[test]
    fn test_foreign_cookie_ignored() {
        let mut srv = server();
        let body = batch(&[Message::Cookie("stale nonsense".to_string()), pull(&srv)]);
        let reply = srv.handle(&signed("reader", "rpass", &body)).unwrap();
        assert!(reply.error.is_none());
    }
}
