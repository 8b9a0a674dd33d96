/// One application's control channel
///
/// Requests are served strictly one at a time, so responses always come
/// back in request order. A request that does not decode is answered with
/// `InvalidRequest`; channel errors end this session only.

use super::dial::DialBroker;
use super::protocol::{Request, Response};
use crate::handoff::{ConnectionMeta, HandoffCoordinator};
use crate::transfer::{FdChannel, TransferError};
use hostlink_common::config::protocol::VERSION;
use hostlink_common::error::Result;
use hostlink_common::{AppIdentity, BrokerError, FailureKind};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ControlSession {
    identity: AppIdentity,
    channel: FdChannel,
    broker: Arc<DialBroker>,
    handoff: Arc<HandoffCoordinator>,
}

impl ControlSession {
    pub fn new(
        identity: AppIdentity,
        channel: FdChannel,
        broker: Arc<DialBroker>,
        handoff: Arc<HandoffCoordinator>,
    ) -> Self {
        Self {
            identity,
            channel,
            broker,
            handoff,
        }
    }

    pub fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    /// Serves requests until the application closes the channel.
    pub async fn run(mut self) -> Result<()> {
        info!("Control session opened for {}", self.identity);

        loop {
            let (request, fds) = match self.channel.recv::<Request>().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Control channel for {} closed", self.identity);
                    break;
                }
                Err(TransferError::Decode(reason)) => {
                    warn!("Malformed request from {}: {}", self.identity, reason);
                    self.fail(BrokerError::invalid(format!("malformed request: {}", reason)))
                        .await?;
                    continue;
                }
                Err(e) => {
                    warn!("Control channel for {} failed: {}", self.identity, e);
                    return Err(e.into());
                }
            };

            debug!("{} request from {}", request.name(), self.identity);
            self.handle(request, fds).await?;
        }

        info!("Control session closed for {}", self.identity);
        Ok(())
    }

    async fn handle(&mut self, request: Request, fds: Vec<OwnedFd>) -> Result<()> {
        if !fds.is_empty() && !matches!(request, Request::OfferHandoff { .. }) {
            warn!(
                "{} sent {} unexpected descriptors with {}; closing them",
                self.identity,
                fds.len(),
                request.name()
            );
        }

        match request {
            Request::Dial {
                destination,
                options,
            } => match self.broker.dial(&self.identity, &destination, options).await {
                Ok(outcome) => {
                    let response = Response::Dialed {
                        peer: outcome.peer,
                        transport: outcome.transport,
                        credential: outcome.credential,
                    };
                    self.channel
                        .send_with_fds(&response, &[outcome.socket.as_fd()])
                        .await?;
                    // The broker keeps no reference to a transferred socket.
                    drop(outcome.socket);
                    Ok(())
                }
                Err(e) => self.fail(e).await,
            },

            Request::OfferHandoff { connections } => {
                if connections.len() != fds.len() {
                    return self
                        .fail(BrokerError::invalid(format!(
                            "offer describes {} connections but carries {} descriptors",
                            connections.len(),
                            fds.len()
                        )))
                        .await;
                }

                let offered: Vec<(ConnectionMeta, OwnedFd)> =
                    connections.into_iter().zip(fds).collect();
                match self.handoff.begin_handoff(&self.identity, offered).await {
                    Ok(token) => self.respond(Response::HandoffOffered { token }).await,
                    Err(e) => self.fail(e).await,
                }
            }

            Request::AwaitHandoff { token } => {
                match self.handoff.await_handoff(&self.identity, &token).await {
                    Ok(outcome) => self.respond(Response::HandoffOutcome { token, outcome }).await,
                    Err(e) => self.fail(e).await,
                }
            }

            Request::Adopt { token } => {
                match self
                    .handoff
                    .complete_handoff(&token, &self.identity, &mut self.channel)
                    .await
                {
                    // `Acknowledged` has already been written.
                    Ok(()) => Ok(()),
                    Err(e) => self.fail(e).await,
                }
            }

            Request::AckAdoption { .. } => {
                self.fail(BrokerError::invalid("no adoption in progress"))
                    .await
            }

            Request::Ping => self.respond(Response::Pong { version: VERSION }).await,
        }
    }

    async fn respond(&mut self, response: Response) -> Result<()> {
        self.channel.send(&response).await?;
        Ok(())
    }

    async fn fail(&mut self, err: BrokerError) -> Result<()> {
        let failure = err.failure();
        if failure.kind == FailureKind::Internal {
            error!("Request from {} failed: {}", self.identity, err);
        }
        self.respond(Response::Failed(failure)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::dial::DialConfig;
    use crate::broker::resolver::{PeerDirectory, StaticResolver};
    use crate::credentials::{CertificateIssuer, Ed25519Signer, IssuerConfig};
    use crate::handoff::HandoffConfig;
    use crate::policy::{PolicyEntry, PolicyRegistry, PolicySnapshot};
    use hostlink_common::{Destination, DialOptions};
    use tokio::io::AsyncWriteExt;

    fn session_pair() -> (FdChannel, tokio::task::JoinHandle<Result<()>>) {
        let identity: AppIdentity = "billing".parse().unwrap();
        let registry = Arc::new(PolicyRegistry::new(
            PolicySnapshot::new(1).with_entry(identity.clone(), PolicyEntry::default()),
        ));
        let issuer = Arc::new(CertificateIssuer::new(
            registry.clone(),
            Arc::new(Ed25519Signer::generate()),
            IssuerConfig::default(),
        ));
        let broker = Arc::new(DialBroker::new(
            registry.clone(),
            issuer,
            Arc::new(StaticResolver::default()),
            Arc::new(PeerDirectory::default()),
            DialConfig::default(),
        ));
        let handoff = Arc::new(HandoffCoordinator::new(registry, HandoffConfig::default()));

        let (client, server) = FdChannel::pair().unwrap();
        let session = ControlSession::new(identity, server, broker, handoff);
        (client, tokio::spawn(session.run()))
    }

    #[tokio::test]
    async fn test_ping_and_ordered_failures() {
        let (mut client, task) = session_pair();

        client.send(&Request::Ping).await.unwrap();
        client
            .send(&Request::Dial {
                destination: Destination::internal("db"),
                options: DialOptions::default(),
            })
            .await
            .unwrap();
        client
            .send(&Request::AckAdoption {
                token: "00".to_string().into(),
            })
            .await
            .unwrap();

        let (first, _): (Response, _) = client.recv().await.unwrap().unwrap();
        assert_eq!(first, Response::Pong { version: VERSION });

        let (second, fds): (Response, _) = client.recv().await.unwrap().unwrap();
        assert!(fds.is_empty());
        match second {
            Response::Failed(failure) => assert_eq!(failure.kind, FailureKind::PolicyDenied),
            other => panic!("unexpected {:?}", other),
        }

        let (third, _): (Response, _) = client.recv().await.unwrap().unwrap();
        match third {
            Response::Failed(failure) => assert_eq!(failure.kind, FailureKind::InvalidRequest),
            other => panic!("unexpected {:?}", other),
        }

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_is_answered_and_session_continues() {
        let identity: AppIdentity = "billing".parse().unwrap();
        let registry = Arc::new(PolicyRegistry::new(PolicySnapshot::new(1)));
        let issuer = Arc::new(CertificateIssuer::new(
            registry.clone(),
            Arc::new(Ed25519Signer::generate()),
            IssuerConfig::default(),
        ));
        let broker = Arc::new(DialBroker::new(
            registry.clone(),
            issuer,
            Arc::new(StaticResolver::default()),
            Arc::new(PeerDirectory::default()),
            DialConfig::default(),
        ));
        let handoff = Arc::new(HandoffCoordinator::new(registry, HandoffConfig::default()));

        let (raw, server) = tokio::net::UnixStream::pair().unwrap();
        let session = ControlSession::new(identity, FdChannel::new(server), broker, handoff);
        let task = tokio::spawn(session.run());

        // A frame whose body names a request variant that does not exist,
        // followed by a valid ping.
        let mut raw = raw;
        raw.write_all(&[4, 0, 0, 0, 0, 99, 0, 0, 0]).await.unwrap();
        let ping = bincode::serialize(&Request::Ping).unwrap();
        raw.write_all(&(ping.len() as u32).to_le_bytes()).await.unwrap();
        raw.write_all(&[0]).await.unwrap();
        raw.write_all(&ping).await.unwrap();

        let mut client = FdChannel::new(raw);
        let (first, _): (Response, _) = client.recv().await.unwrap().unwrap();
        match first {
            Response::Failed(failure) => assert_eq!(failure.kind, FailureKind::InvalidRequest),
            other => panic!("unexpected {:?}", other),
        }

        let (second, _): (Response, _) = client.recv().await.unwrap().unwrap();
        assert_eq!(second, Response::Pong { version: VERSION });

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_offer_with_mismatched_descriptors() {
        let (mut client, _task) = session_pair();
        client
            .send(&Request::OfferHandoff {
                connections: vec![ConnectionMeta::new("websocket", vec![])],
            })
            .await
            .unwrap();

        let (response, _): (Response, _) = client.recv().await.unwrap().unwrap();
        match response {
            Response::Failed(failure) => assert_eq!(failure.kind, FailureKind::InvalidRequest),
            other => panic!("unexpected {:?}", other),
        }
    }
}
