//! Shared fixtures for the integration tests

#![allow(dead_code)]

use hostlink_common::{AppIdentity, NetworkLocation};
use hostlink_core::broker::ServiceTable;
use hostlink_core::{
    BrokerClient, CertificateIssuer, ControlSession, DialBroker, DialConfig, Ed25519Signer,
    FdChannel, HandoffConfig, HandoffCoordinator, IssuerConfig, PeerDirectory, PolicyRegistry,
    PolicySnapshot, StaticResolver,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub fn id(name: &str) -> AppIdentity {
    name.parse().unwrap()
}

/// A broker with every component wired in-process
pub struct Broker {
    pub registry: Arc<PolicyRegistry>,
    pub resolver: Arc<StaticResolver>,
    pub peers: Arc<PeerDirectory>,
    pub dial: Arc<DialBroker>,
    pub handoff: Arc<HandoffCoordinator>,
}

impl Broker {
    pub fn new(policy: PolicySnapshot) -> Self {
        Self::with_handoff_config(policy, HandoffConfig::default())
    }

    pub fn with_handoff_config(policy: PolicySnapshot, handoff: HandoffConfig) -> Self {
        let registry = Arc::new(PolicyRegistry::new(policy));
        let issuer = Arc::new(CertificateIssuer::new(
            registry.clone(),
            Arc::new(Ed25519Signer::generate()),
            IssuerConfig::default(),
        ));
        let resolver = Arc::new(StaticResolver::default());
        let peers = Arc::new(PeerDirectory::default());
        let dial = Arc::new(DialBroker::new(
            registry.clone(),
            issuer,
            resolver.clone(),
            peers.clone(),
            DialConfig::default(),
        ));
        let handoff = Arc::new(HandoffCoordinator::new(registry.clone(), handoff));

        Self {
            registry,
            resolver,
            peers,
            dial,
            handoff,
        }
    }

    pub fn with_service(self, name: &str, location: NetworkLocation) -> Self {
        self.resolver
            .replace(ServiceTable::default().with_service(name, vec![location]));
        self
    }

    pub fn with_peer(self, name: &str, path: PathBuf) -> Self {
        let mut peers = BTreeMap::new();
        peers.insert(name.to_string(), path);
        self.peers.replace(peers);
        self
    }

    /// Opens a control session bound to `identity` and returns its client.
    pub fn client(&self, identity: &str) -> BrokerClient {
        let (client, server) = FdChannel::pair().unwrap();
        let session = ControlSession::new(
            id(identity),
            server,
            self.dial.clone(),
            self.handoff.clone(),
        );
        tokio::spawn(session.run());
        BrokerClient::from_channel(client)
    }
}

/// A TLS ClientHello record carrying `server_name`
pub fn client_hello(server_name: &str) -> Vec<u8> {
    let mut sni = vec![0x00];
    sni.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
    sni.extend_from_slice(server_name.as_bytes());
    let mut sni_ext = (sni.len() as u16).to_be_bytes().to_vec();
    sni_ext.extend_from_slice(&sni);

    let mut extensions = vec![0x00, 0x00];
    extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_ext);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x42; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let len = (body.len() as u32).to_be_bytes();
    let mut handshake = vec![0x01, len[1], len[2], len[3]];
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
