// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared scaffolding for the end-to-end scenarios (§8): a scratch config
//! and state directory tree, a `LastseenIndex` over it, and a helper to
//! spawn a `ConnectionPool` bound to an ephemeral loopback port.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use cfnet_core::{
    cfg::{
        ConfigHandle,
        config::{Config, ListenerConfig, PathsConfig, TrustConfig},
        enums::{DigestMethod, YesNo},
    },
    lastseen::LastseenIndex,
    server::{access::PolicyTree, listener::ConnectionPool},
    store::Store,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufStream},
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_rustls::client::TlsStream;

pub const FRAME_DEADLINE: Duration = Duration::from_secs(2);

fn self_signed(name: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec![name.to_string()]).expect("self-signed cert");
    let key = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
    (cert.der().clone(), key)
}

/// Writes a self-signed `localhost` identity into `keyring_dir` as
/// `host.crt`/`host.key`, matching what `tls::load_server_identity` expects.
fn write_host_identity(keyring_dir: &std::path::Path) {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("self-signed cert");
    std::fs::write(keyring_dir.join("host.crt"), cert.pem()).expect("write host.crt");
    std::fs::write(keyring_dir.join("host.key"), key_pair.serialize_pem()).expect("write host.key");
}

pub struct Scratch {
    pub dir: TempDir,
    pub state_dir: PathBuf,
}

/// Builds a scratch directory tree and a `ConfigHandle` loaded from a YAML
/// file written into it, short idle/sweep timers so reap scenarios run fast.
pub async fn scratch_config() -> (Scratch, ConfigHandle) {
    let dir = TempDir::new().expect("tempdir");
    let state_dir = dir.path().join("state");
    let policy_dir = dir.path().join("policy");
    let keyring_dir = dir.path().join("keys");
    std::fs::create_dir_all(&state_dir).expect("mkdir state");
    std::fs::create_dir_all(&policy_dir).expect("mkdir policy");
    std::fs::create_dir_all(&keyring_dir).expect("mkdir keys");
    write_host_identity(&keyring_dir);

    // Bind an ephemeral port up front so the listener in the pool binds to
    // the exact address the test already knows, rather than guessing one.
    let probe = TcpListener::bind("127.0.0.1:0").await.expect("probe bind");
    let bind_address = probe.local_addr().expect("local addr");
    drop(probe);

    let config = Config {
        listener: ListenerConfig {
            bind_address,
            backlog: 16,
            max_connections: 8,
            max_queue_wait: Duration::from_secs(1),
            idle_timeout: Duration::from_millis(150),
            idle_sweep_interval: Duration::from_millis(30),
            idle_sweep_age: Duration::from_millis(150),
            reload_grace_period: Duration::from_millis(50),
            legacy_protocol: YesNo::No,
        },
        trust: TrustConfig {
            trust_keys_from: vec![ipnet::IpNet::V4("127.0.0.0/8".parse().expect("cidr"))],
            strict: YesNo::No,
            keyring_directory: keyring_dir.to_string_lossy().into_owned(),
            digest_method: DigestMethod::Sha256,
        },
        paths: PathsConfig {
            state_directory: state_dir.to_string_lossy().into_owned(),
            policy_root: policy_dir.to_string_lossy().into_owned(),
            repair_trigger_file: cfnet_core::store::REPAIR_TRIGGER_FILE.to_string(),
        },
    };

    let config_path = dir.path().join("cf-serverd.yaml");
    std::fs::write(&config_path, serde_yaml::to_string(&config).expect("serialize config")).expect("write config");
    let handle = ConfigHandle::load(&config_path).expect("load config");

    (Scratch { dir, state_dir }, handle)
}

pub fn open_lastseen(state_dir: &std::path::Path) -> LastseenIndex {
    let store = Store::open(state_dir.join("lastseen.db")).expect("open store");
    LastseenIndex::new(store)
}

/// Spawns a `ConnectionPool` accept loop on its own task. Returns the bind
/// address and a shutdown sender for teardown; the caller should send
/// `true` and then await a short grace period before dropping the scratch
/// directory.
pub fn spawn_pool(config: ConfigHandle, lastseen: LastseenIndex, policy: PolicyTree) -> (SocketAddr, watch::Sender<bool>) {
    let bind_address = config.current().listener.bind_address;
    let pool = Arc::new(ConnectionPool::new(config, lastseen, policy));
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        pool.run(rx).await.expect("pool run");
    });
    (bind_address, tx)
}

async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("could not connect to {addr} after retrying");
}

/// Connects to the pool's listener, performs the TLS handshake with a
/// fresh self-signed client identity, and runs the version/username
/// exchange through to the welcome banner, leaving the stream ready for
/// `framing::transaction::{read_message, write_frame}`.
pub async fn connect_and_handshake(addr: SocketAddr) -> BufStream<TlsStream<TcpStream>> {
    let tcp = connect_with_retry(addr).await;
    let (client_cert, client_key) = self_signed("test-client");
    let connector = cfnet_core::tls::client_tls_connector(vec![client_cert], client_key).expect("client connector");
    let server_name = rustls::pki_types::ServerName::try_from("localhost").expect("server name").to_owned();
    let tls = connector.connect(server_name, tcp).await.expect("tls handshake");

    let mut buffered = BufStream::new(tls);
    cfnet_core::tls::negotiate_version(&mut buffered, cfnet_core::tls::CURRENT_PROTOCOL_VERSION, FRAME_DEADLINE)
        .await
        .expect("negotiate version");
    cfnet_core::tls::send_username(&mut buffered, "test-user", FRAME_DEADLINE).await.expect("send username");
    let mut welcome = String::new();
    buffered.read_line(&mut welcome).await.expect("read welcome");
    assert!(welcome.starts_with("OK:"), "unexpected welcome banner: {welcome:?}");

    buffered
}
