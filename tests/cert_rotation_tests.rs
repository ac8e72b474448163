//! Serving certificate rotation tests
//!
//! Certificates are generated per test with `CertGenerator`, written to a
//! temporary directory laid out like a mounted `kubernetes.io/tls` secret,
//! and picked up through `DirectorySource` and `CertificateWatcher`.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kim_snatch::tls::{
    self, CaParams, CertGenerator, CertificateSource, CertificateStore, CertificateWatcher,
    DirectorySource, GeneratedCert, ReloadOutcome, ServingCertParams,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConnection};

fn issue_ca() -> GeneratedCert {
    CertGenerator::init_ca(&CaParams {
        cn: "kim-snatch rotation CA",
        validity_days: 30,
    })
    .unwrap()
}

fn serving(ca: &GeneratedCert) -> GeneratedCert {
    CertGenerator::issue_serving(
        &ServingCertParams {
            san_dns: vec!["localhost".into()],
            validity_days: 30,
        },
        &ca.cert_pem,
        &ca.key_pem,
    )
    .unwrap()
}

fn write_secret(dir: &Path, ca: &GeneratedCert, leaf: &GeneratedCert) {
    std::fs::write(dir.join("tls.crt"), &leaf.cert_pem).unwrap();
    std::fs::write(dir.join("tls.key"), &leaf.key_pem).unwrap();
    std::fs::write(dir.join("ca.crt"), &ca.cert_pem).unwrap();
}

fn watcher(dir: &Path, store: &Arc<CertificateStore>) -> CertificateWatcher {
    CertificateWatcher::new(
        Arc::new(DirectorySource::new(dir)) as Arc<dyn CertificateSource>,
        Arc::clone(store),
        Duration::from_millis(50),
        Duration::from_millis(10),
    )
}

/// Complete an in-memory TLS handshake and return the server's leaf.
fn handshake_leaf(store: &Arc<CertificateStore>, ca_pem: &str) -> CertificateDer<'static> {
    let server_config = Arc::new(tls::server_config(Arc::clone(store)).unwrap());

    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from_pem_slice(ca_pem.as_bytes()).unwrap())
        .unwrap();
    let client_config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    let mut client = ClientConnection::new(
        Arc::new(client_config),
        ServerName::try_from("localhost").unwrap(),
    )
    .unwrap();
    let mut server = ServerConnection::new(server_config).unwrap();

    for _ in 0..10 {
        if !client.is_handshaking() && !server.is_handshaking() {
            break;
        }
        let mut buf = Vec::new();
        while client.wants_write() {
            client.write_tls(&mut buf).unwrap();
        }
        if !buf.is_empty() {
            server.read_tls(&mut buf.as_slice()).unwrap();
            server.process_new_packets().unwrap();
        }

        let mut buf = Vec::new();
        while server.wants_write() {
            server.write_tls(&mut buf).unwrap();
        }
        if !buf.is_empty() {
            client.read_tls(&mut buf.as_slice()).unwrap();
            client.process_new_packets().unwrap();
        }
    }
    assert!(!client.is_handshaking(), "handshake did not complete");

    client.peer_certificates().unwrap()[0].clone().into_owned()
}

fn leaf_der(cert: &GeneratedCert) -> CertificateDer<'static> {
    CertificateDer::from_pem_slice(cert.cert_pem.as_bytes()).unwrap()
}

#[tokio::test]
async fn test_rotation_changes_fingerprint_exactly_once() {
    // GIVEN: an initial certificate on disk, loaded
    let dir = tempfile::tempdir().unwrap();
    let ca = issue_ca();
    write_secret(dir.path(), &ca, &serving(&ca));
    let store = Arc::new(CertificateStore::new());
    let mut w = watcher(dir.path(), &store);
    assert_eq!(w.reload().await, ReloadOutcome::Activated(1));
    let first = store.active_fingerprint().unwrap();

    // WHEN: a new certificate is written and the watcher checks repeatedly
    write_secret(dir.path(), &ca, &serving(&ca));
    let outcomes = [w.reload().await, w.reload().await, w.reload().await];

    // THEN: one activation, then nothing
    assert_eq!(
        outcomes,
        [
            ReloadOutcome::Activated(2),
            ReloadOutcome::Unchanged,
            ReloadOutcome::Unchanged
        ]
    );
    assert_ne!(store.active_fingerprint().unwrap(), first);
}

#[tokio::test]
async fn test_mismatched_pair_keeps_serving_last_good() {
    // GIVEN: generation 1 active
    let dir = tempfile::tempdir().unwrap();
    let ca = issue_ca();
    let good = serving(&ca);
    write_secret(dir.path(), &ca, &good);
    let store = Arc::new(CertificateStore::new());
    let mut w = watcher(dir.path(), &store);
    w.reload().await;

    // WHEN: the key of another issuance lands next to the certificate
    let other = serving(&ca);
    std::fs::write(dir.path().join("tls.key"), &other.key_pem).unwrap();
    let outcome = w.reload().await;

    // THEN: rejected, failed state, still generation 1 with the old leaf
    assert!(matches!(outcome, ReloadOutcome::Rejected(ref r) if r.contains("does not match")));
    assert_eq!(store.state().name(), "failed");
    let served = store.snapshot().unwrap();
    assert_eq!(served.generation(), 1);
    assert_eq!(handshake_leaf(&store, &ca.cert_pem), leaf_der(&good));

    // WHEN: a consistent pair arrives
    let fixed = serving(&ca);
    write_secret(dir.path(), &ca, &fixed);

    // THEN: active again with the new leaf
    assert_eq!(w.reload().await, ReloadOutcome::Activated(2));
    assert_eq!(handshake_leaf(&store, &ca.cert_pem), leaf_der(&fixed));
}

#[tokio::test]
async fn test_second_mismatched_pair_is_also_rejected() {
    // GIVEN: generation 1 active
    let dir = tempfile::tempdir().unwrap();
    let ca = issue_ca();
    let good = serving(&ca);
    write_secret(dir.path(), &ca, &good);
    let store = Arc::new(CertificateStore::new());
    let mut w = watcher(dir.path(), &store);
    w.reload().await;

    // WHEN: two different foreign keys land next to the certificate in turn
    for _ in 0..2 {
        std::fs::write(dir.path().join("tls.key"), serving(&ca).key_pem).unwrap();
        let outcome = w.reload().await;

        // THEN: both are rejected and the store reports the fault
        assert!(matches!(outcome, ReloadOutcome::Rejected(_)));
        assert_eq!(store.state().name(), "failed");
        assert_eq!(handshake_leaf(&store, &ca.cert_pem), leaf_der(&good));
    }
}

#[tokio::test]
async fn test_new_handshakes_see_rotated_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let ca = issue_ca();
    let first = serving(&ca);
    write_secret(dir.path(), &ca, &first);
    let store = Arc::new(CertificateStore::new());
    let mut w = watcher(dir.path(), &store);
    w.reload().await;
    assert_eq!(handshake_leaf(&store, &ca.cert_pem), leaf_der(&first));

    let second = serving(&ca);
    write_secret(dir.path(), &ca, &second);
    w.reload().await;

    assert_eq!(handshake_leaf(&store, &ca.cert_pem), leaf_der(&second));
}

#[tokio::test]
async fn test_concurrent_readers_see_matching_pairs_and_monotonic_generations() {
    // GIVEN: readers hammering the store
    let dir = tempfile::tempdir().unwrap();
    let ca = issue_ca();
    write_secret(dir.path(), &ca, &serving(&ca));
    let store = Arc::new(CertificateStore::new());
    let mut w = watcher(dir.path(), &store);
    w.reload().await;

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || {
                let mut last = 0;
                let mut reads = 0u64;
                loop {
                    let bundle = store.snapshot().unwrap();
                    assert!(bundle.certified_key().keys_match().is_ok());
                    assert!(bundle.generation() >= last, "generation went backwards");
                    last = bundle.generation();
                    reads += 1;
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                }
                (last, reads)
            })
        })
        .collect();

    // WHEN: five rotations happen
    for _ in 0..5 {
        write_secret(dir.path(), &ca, &serving(&ca));
        assert!(matches!(w.reload().await, ReloadOutcome::Activated(_)));
    }
    stop.store(true, Ordering::Relaxed);

    // THEN: every reader finished cleanly
    for reader in readers {
        let (last, reads) = reader.await.unwrap();
        assert!(last <= 6);
        assert!(reads > 0);
    }
    assert_eq!(store.snapshot().unwrap().generation(), 6);
}

#[tokio::test]
async fn test_watch_loop_picks_up_regenerated_secret() {
    // GIVEN: a running watcher
    let dir = tempfile::tempdir().unwrap();
    let ca = issue_ca();
    write_secret(dir.path(), &ca, &serving(&ca));
    let store = Arc::new(CertificateStore::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(watcher(dir.path(), &store).run(shutdown_rx));
    store.wait_active(Duration::from_secs(5)).await.unwrap();
    let mut generations = store.subscribe();
    generations.borrow_and_update();

    // WHEN: the secret is deleted and regenerated with a new CA
    for name in ["tls.crt", "tls.key", "ca.crt"] {
        std::fs::remove_file(dir.path().join(name)).unwrap();
    }
    let new_ca = issue_ca();
    write_secret(dir.path(), &new_ca, &serving(&new_ca));

    // THEN: a new generation carrying the new CA becomes active
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            generations.changed().await.unwrap();
            let bundle = store.snapshot().unwrap();
            if bundle.ca_pem() == Some(new_ca.cert_pem.as_bytes()) {
                break;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(store.state().name(), "active");

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_startup_without_certificate_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CertificateStore::new());
    let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(watcher(dir.path(), &store).run(shutdown_rx));

    let err = store
        .wait_active(Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("no valid serving certificate"), "{err}");
}
