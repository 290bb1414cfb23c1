//! Client side of a sync: build a request, exchange it, absorb the reply,
//! and repeat until there is nothing left to move.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::hash::ArtifactId;
use crate::store::ArtifactStore;
use crate::transport::Transport;
use crate::xfer::auth::login_message;
use crate::xfer::codec::{BatchReader, Message};
use crate::xfer::session::{Accepted, Session, XferStats};
use bytes::BytesMut;

/// Which directions a sync moves artifacts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncRequest {
    pub pull: bool,
    pub push: bool,
    pub clone: bool,
}

impl SyncRequest {
    pub fn pull() -> Self {
        Self {
            pull: true,
            ..Default::default()
        }
    }

    pub fn push() -> Self {
        Self {
            push: true,
            ..Default::default()
        }
    }

    /// Pull and push
    pub fn sync() -> Self {
        Self {
            pull: true,
            push: true,
            clone: false,
        }
    }

    pub fn clone_repo() -> Self {
        Self {
            clone: true,
            ..Default::default()
        }
    }

    /// Receives artifacts from the server
    pub fn receives(&self) -> bool {
        self.pull || self.clone
    }
}

/// Login name and password sent with every round.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// What one round achieved; input to [`should_continue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub round: usize,
    /// Artifacts accepted from the reply
    pub received: u64,
    /// Phantoms created while reading the reply
    pub new_phantoms: u64,
    /// Phantoms still outstanding after the round
    pub phantoms_remaining: usize,
    /// Local artifacts the server has not been sent yet
    pub unsent_remaining: usize,
    /// Messages queued for the next request (answers to `gimme`, requests
    /// for dangling delta sources)
    pub carry_over: usize,
}

/// How many phantoms to request next round: twice what the last round
/// delivered, never below `floor`.
pub fn phantom_request_limit(floor: usize, received: u64) -> usize {
    floor.max(2 * received as usize)
}

/// Whether another round would make progress.
pub fn should_continue(request: &SyncRequest, stats: &RoundStats) -> bool {
    if request.receives()
        && (stats.received > 0 || stats.new_phantoms > 0)
        && stats.phantoms_remaining > 0
    {
        return true;
    }
    if request.push && stats.unsent_remaining > 0 {
        return true;
    }
    stats.carry_over > 0
}

/// Summary of a finished sync.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub rounds: usize,
    pub stats: XferStats,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Work queued by one reply for the next request.
#[derive(Debug, Default)]
struct CarryOver {
    /// Ids the server asked for
    files: Vec<ArtifactId>,
    /// Sources of deltas that could not be applied
    gimmes: Vec<ArtifactId>,
}

impl CarryOver {
    fn len(&self) -> usize {
        self.files.len() + self.gimmes.len()
    }
}

/// Run a sync against `transport` until it converges.
pub async fn sync<S, T>(
    store: &mut S,
    transport: &mut T,
    config: &SyncConfig,
    request: SyncRequest,
    credentials: Option<&Credentials>,
) -> Result<SyncReport>
where
    S: ArtifactStore + ?Sized,
    T: Transport + ?Sized,
{
    let mut report = SyncReport::default();
    let mut carry = CarryOver::default();
    let mut cookie: Option<String> = None;
    let mut cloned = false;
    let mut mx_phantom_req = config.phantom_request_floor;

    loop {
        if report.rounds >= config.max_rounds {
            return Err(SyncError::NoProgress {
                rounds: report.rounds,
            });
        }
        report.rounds += 1;
        let round = report.rounds;

        store.begin();

        // ---- build the request ----
        let mut out = Session::new(config.max_upload, config.delta_margin).consume_unsent(true);
        if request.clone && !cloned {
            out.emit(&Message::Clone);
        } else {
            let server_code = store.server_code().to_string();
            let project_code = store.project_code().to_string();
            if request.receives() {
                out.emit(&Message::Pull {
                    server_code: server_code.clone(),
                    project_code: project_code.clone(),
                });
            }
            if request.push {
                out.emit(&Message::Push {
                    server_code,
                    project_code,
                });
            }
        }
        if let Some(text) = &cookie {
            out.emit(&Message::Cookie(text.clone()));
        }

        let built = build_body(&mut *store, &mut out, &request, &carry, mx_phantom_req);
        if let Err(e) = built {
            store.rollback();
            return Err(e);
        }

        let body = out.take_output();
        let mut batch = BytesMut::with_capacity(body.len() + 128);
        if let Some(creds) = credentials {
            login_message(&creds.user, &creds.password, &body).encode(&mut batch);
        }
        batch.extend_from_slice(&body);
        let batch = batch.freeze();

        // ---- exchange ----
        tracing::debug!("round {}: sending {} bytes", round, batch.len());
        report.bytes_sent += batch.len() as u64;
        let reply = match transport.exchange(batch).await {
            Ok(reply) => reply,
            Err(e) => {
                store.rollback();
                return Err(SyncError::Transport(e));
            }
        };
        report.bytes_received += reply.len() as u64;

        // ---- absorb the reply ----
        let mut inbound = Session::new(config.max_upload, config.delta_margin);
        let mut next = CarryOver::default();
        let absorbed = absorb_reply(
            &mut *store,
            &mut inbound,
            &request,
            &reply,
            &mut next,
            &mut cookie,
            &mut cloned,
        );
        if let Err(e) = absorbed {
            tracing::warn!("round {} failed: {}", round, e);
            store.rollback();
            return Err(e);
        }
        store.commit();

        report.stats += out.stats;
        report.stats += inbound.stats;

        let stats = RoundStats {
            round,
            received: inbound.stats.received(),
            new_phantoms: inbound.stats.new_phantoms,
            phantoms_remaining: store.phantoms().len(),
            unsent_remaining: store.unsent().len(),
            carry_over: next.len(),
        };
        tracing::info!(
            "round {}: sent {} received {} phantoms {} unsent {}",
            round,
            out.stats.sent(),
            stats.received,
            stats.phantoms_remaining,
            stats.unsent_remaining
        );

        mx_phantom_req = phantom_request_limit(config.phantom_request_floor, stats.received);
        carry = next;

        if !should_continue(&request, &stats) {
            break;
        }
    }

    Ok(report)
}

/// Queue everything after the direction lines: carry-over, phantom requests
/// and the push set.
fn build_body<S: ArtifactStore + ?Sized>(
    store: &mut S,
    out: &mut Session,
    request: &SyncRequest,
    carry: &CarryOver,
    mx_phantom_req: usize,
) -> Result<()> {
    for id in &carry.files {
        out.send_file(store, id)?;
    }
    for id in &carry.gimmes {
        out.send_gimme(&*store, id);
    }

    if request.receives() {
        for id in store.phantoms().into_iter().take(mx_phantom_req) {
            out.send_gimme(&*store, &id);
        }
    }

    if request.push {
        for id in store.unsent() {
            out.send_file(store, &id)?;
        }
        for id in store.unclustered() {
            if !store.is_phantom(&id) {
                out.send_igot(&*store, &id);
            }
        }
    }
    Ok(())
}

fn absorb_reply<S: ArtifactStore + ?Sized>(
    store: &mut S,
    inbound: &mut Session,
    request: &SyncRequest,
    reply: &[u8],
    next: &mut CarryOver,
    cookie: &mut Option<String>,
    cloned: &mut bool,
) -> Result<()> {
    let mut reader = BatchReader::new(reply);
    while let Some((line, parsed)) = reader.next_message() {
        let message = parsed.map_err(|e| SyncError::Protocol(e.to_string()))?;
        tracing::debug!("recv {}", line.tokens.join(" "));

        match message {
            Message::File {
                id,
                delta_source,
                content,
            } => {
                if !request.receives() {
                    tracing::warn!("ignoring unrequested file {}", id);
                    continue;
                }
                if let Accepted::Dangling { source } =
                    inbound.accept_file(store, &id, delta_source.as_ref(), content)?
                {
                    next.gimmes.push(source);
                }
            }

            Message::Igot(id) => {
                inbound.stats.igot_received += 1;
                if request.receives() && store.new_phantom(&id) {
                    inbound.stats.new_phantoms += 1;
                }
            }

            Message::Gimme(id) => {
                inbound.stats.gimme_received += 1;
                // Only requests we can answer carry over; anything else
                // would keep the loop alive with nothing to send.
                if request.push && store.is_available(&id) && !store.is_shunned(&id) {
                    next.files.push(id);
                }
            }

            Message::Push { project_code, .. } if request.clone => {
                if !*cloned {
                    tracing::info!("cloning project {}", project_code);
                }
                store.set_project_code(&project_code);
                *cloned = true;
            }

            Message::Cookie(text) => *cookie = Some(text),

            Message::Message(text) => tracing::info!("server: {}", text),

            Message::Error(text) => return Err(SyncError::Remote(text)),

            other => tracing::warn!("unexpected {} line from server", other.verb()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> RoundStats {
        RoundStats {
            round: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_stop_when_nothing_moves() {
        assert!(!should_continue(&SyncRequest::sync(), &stats()));
    }

    #[test]
    fn test_continue_while_phantoms_resolve() {
        let s = RoundStats {
            received: 3,
            phantoms_remaining: 10,
            ..stats()
        };
        assert!(should_continue(&SyncRequest::pull(), &s));
        assert!(should_continue(&SyncRequest::clone_repo(), &s));
        // A push never waits on phantoms
        assert!(!should_continue(&SyncRequest::push(), &s));
    }

    #[test]
    fn test_stuck_phantoms_stop_the_loop() {
        // Phantoms the server cannot supply: nothing received, nothing new
        let s = RoundStats {
            phantoms_remaining: 10,
            ..stats()
        };
        assert!(!should_continue(&SyncRequest::pull(), &s));
    }

    #[test]
    fn test_continue_with_unsent_or_carry_over() {
        let unsent = RoundStats {
            unsent_remaining: 1,
            ..stats()
        };
        assert!(should_continue(&SyncRequest::push(), &unsent));
        assert!(!should_continue(&SyncRequest::pull(), &unsent));

        let carry = RoundStats {
            carry_over: 2,
            ..stats()
        };
        assert!(should_continue(&SyncRequest::pull(), &carry));
    }

    #[test]
    fn test_phantom_request_limit_follows_received() {
        assert_eq!(phantom_request_limit(200, 0), 200);
        assert_eq!(phantom_request_limit(200, 40), 200);
        assert_eq!(phantom_request_limit(200, 150), 300);
        assert_eq!(phantom_request_limit(0, 0), 0);
    }
}
