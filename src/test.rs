use std::{future::Future, sync::Arc, time::Duration};

use k256::ecdsa::{RecoveryId, VerifyingKey};
use rand::{rngs::StdRng, SeedableRng};
use rand_core::OsRng;

use crate::{
    cancel::Cancellation,
    chain::{local::LocalChain, Address, ChainHandle},
    client::{Client, RegistrationState},
    compat::scalar_from_digest,
    config::{ClientConfig, Config},
    keygen::{keygen, KeygenOutput},
    net::{local::LocalNetwork, SessionId, Transport},
    node::Node,
    protocol::{run_protocol, Participant, Protocol},
    session::SigningSession,
    signer::{GroupParameters, ThresholdSigner},
    sign::{sign, FullSignature},
    storage::{FileKeyStore, KeyStore, MemoryKeyStore},
    Signature,
};

const TIMEOUT: Duration = Duration::from_secs(30);

fn operator(x: u8) -> Address {
    Address::from([x; 20])
}

fn digest(prefix: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..prefix.len()].copy_from_slice(prefix);
    out
}

/// Poll `condition` until it holds, or give up after a while.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        smol::Timer::after(Duration::from_millis(10)).await;
    }
    condition()
}

fn block_on_with_timeout<T>(fut: impl Future<Output = T>) -> T {
    smol::block_on(async {
        smol::future::or(fut, async {
            smol::Timer::after(Duration::from_secs(60)).await;
            panic!("test timed out");
        })
        .await
    })
}

fn run_keygen(
    participants: &[Participant],
    threshold: usize,
    seed: Option<u64>,
) -> Vec<(Participant, KeygenOutput)> {
    let mut protocols: Vec<(Participant, Box<dyn Protocol<Output = KeygenOutput> + Send>)> =
        Vec::with_capacity(participants.len());

    for (i, p) in participants.iter().enumerate() {
        let protocol = match seed {
            Some(seed) => {
                let rng = StdRng::seed_from_u64(seed + i as u64);
                Box::new(keygen(participants, *p, threshold, rng).unwrap())
                    as Box<dyn Protocol<Output = KeygenOutput> + Send>
            }
            None => Box::new(keygen(participants, *p, threshold, OsRng).unwrap()),
        };
        protocols.push((*p, protocol));
    }

    run_protocol(protocols).unwrap()
}

fn single_signer(keep: Address, seed: Option<u64>) -> ThresholdSigner {
    let me = Participant::from(0u32);
    let (_, key_share) = run_keygen(&[me], 1, seed).remove(0);
    ThresholdSigner::new(keep, GroupParameters::for_members(vec![me], me), key_share).unwrap()
}

fn check_signature(public_key: &crate::PublicKey, digest: &[u8; 32], signature: &Signature) {
    assert!(public_key.verify_digest(digest, signature));

    let verifying_key = VerifyingKey::from_affine(*public_key.as_affine()).unwrap();
    let recovered = VerifyingKey::recover_from_prehash(
        digest,
        &signature.to_k256().unwrap(),
        RecoveryId::from_byte(signature.recovery_id).unwrap(),
    )
    .unwrap();
    assert_eq!(recovered, verifying_key);
}

#[test]
fn test_engine_five_parties() {
    let participants: Vec<Participant> = (0..5u32).map(Participant::from).collect();
    let threshold = 3;
    let keys = run_keygen(&participants, threshold, None);
    let public_key = keys[0].1.public_key;
    assert!(keys.iter().all(|(_, k)| k.public_key == public_key));

    let msg_hash = scalar_from_digest(&digest(b"five parties"));
    let mut protocols: Vec<(Participant, Box<dyn Protocol<Output = FullSignature> + Send>)> =
        Vec::new();
    for (p, key) in keys {
        let protocol = sign(&participants, p, key, threshold, msg_hash, OsRng).unwrap();
        protocols.push((p, Box::new(protocol)));
    }
    let signatures = run_protocol(protocols).unwrap();

    let first = &signatures[0].1;
    assert!(signatures.iter().all(|(_, s)| s == first));
    assert!(first.verify(&public_key, &msg_hash));
}

#[test]
fn test_single_party_session() {
    let network: Arc<dyn Transport> = Arc::new(LocalNetwork::new());
    let signer = Arc::new(single_signer(operator(0x4b), None));
    let digest = digest(b"single party");

    let signature = block_on_with_timeout(async {
        SigningSession::initialize(signer.clone(), digest, network, TIMEOUT, OsRng)
            .await
            .unwrap()
            .sign()
            .await
            .unwrap()
    });
    check_signature(&signer.public_key(), &digest, &signature);
}

#[test]
fn test_deterministic_signing() {
    let digest = digest(&[0x12, 0x34]);
    let sign_once = || {
        let network: Arc<dyn Transport> = Arc::new(LocalNetwork::new());
        let signer = Arc::new(single_signer(operator(0x4b), Some(7)));
        let signature = block_on_with_timeout(async {
            SigningSession::initialize(
                signer.clone(),
                digest,
                network,
                TIMEOUT,
                StdRng::seed_from_u64(42),
            )
            .await
            .unwrap()
            .sign()
            .await
            .unwrap()
        });
        (signer.public_key(), signature)
    };

    let (public_key, first) = sign_once();
    let (_, second) = sign_once();
    assert_eq!(first.r_bytes(), second.r_bytes());
    assert_eq!(first.s_bytes(), second.s_bytes());
    check_signature(&public_key, &digest, &first);
}

#[test]
fn test_nodes_generate_and_sign() {
    let chain = LocalChain::new();
    let network = LocalNetwork::new();
    let members: Vec<Address> = (1..=3).map(operator).collect();
    let keep = chain.open_keep(members.clone());

    let nodes: Vec<Node> = members
        .iter()
        .map(|m| {
            Node::new(
                Arc::new(chain.connect(*m)),
                Arc::new(network.clone()),
                TIMEOUT,
                TIMEOUT,
            )
        })
        .collect();

    let signers: Vec<Arc<ThresholdSigner>> = block_on_with_timeout(async {
        let tasks: Vec<_> = nodes
            .iter()
            .cloned()
            .map(|node| {
                let members = members.clone();
                smol::spawn(async move {
                    let (me, participants) =
                        node.announce_signer_presence(keep, &members).await.unwrap();
                    node.generate_signer_for_keep(keep, me, participants)
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut signers = Vec::new();
        for task in tasks {
            signers.push(Arc::new(task.await));
        }
        signers
    });

    let public_key = signers[0].public_key();
    assert!(signers.iter().all(|s| s.public_key() == public_key));
    assert_eq!(chain.submitted_public_keys(keep).len(), 3);
    assert_eq!(signers[0].group().threshold, 2);

    let digest = digest(b"three nodes");
    let signatures: Vec<Signature> = block_on_with_timeout(async {
        let tasks: Vec<_> = nodes
            .iter()
            .cloned()
            .zip(signers.iter().cloned())
            .map(|(node, signer)| {
                smol::spawn(async move { node.calculate_signature(signer, digest).await.unwrap() })
            })
            .collect();
        let mut signatures = Vec::new();
        for task in tasks {
            signatures.push(task.await);
        }
        signatures
    });

    for signature in &signatures {
        assert_eq!(signature.r_bytes(), signatures[0].r_bytes());
        check_signature(&public_key, &digest, signature);
    }
    assert_eq!(chain.submitted_signatures(keep).len(), 3);
    assert_eq!(network.subscribers(&SessionId::signing(keep, &digest)), 0);
}

struct Deployment {
    chain: LocalChain,
    network: LocalNetwork,
    members: Vec<Address>,
    clients: Vec<Client>,
    cancel: Cancellation,
}

impl Deployment {
    fn start(size: u8) -> Self {
        let chain = LocalChain::new();
        let network = LocalNetwork::new();
        let members: Vec<Address> = (1..=size).map(operator).collect();
        let cancel = Cancellation::new();
        let config = ClientConfig::default();

        let clients = block_on_with_timeout(async {
            let mut clients = Vec::new();
            for member in &members {
                let client = Client::initialize(
                    &cancel,
                    &config,
                    Arc::new(chain.connect(*member)),
                    Arc::new(network.clone()),
                    Arc::new(MemoryKeyStore::new()),
                )
                .await
                .unwrap();
                clients.push(client);
            }
            clients
        });

        Self {
            chain,
            network,
            members,
            clients,
            cancel,
        }
    }

    /// Create a keep of every member, and wait for its events to be watched.
    fn create_keep(&self) -> Address {
        let keep = self.chain.create_keep(self.members.clone());
        let ready = block_on_with_timeout(eventually(|| {
            self.clients.iter().all(|c| c.is_monitoring(keep))
                && self.chain.signature_subscriptions(keep) == self.members.len()
                && self.chain.keep_closed_subscriptions(keep) == self.members.len()
        }));
        assert!(ready);
        keep
    }

    fn shutdown(self) {
        self.cancel.cancel();
        let clients = self.clients;
        block_on_with_timeout(async {
            for client in clients {
                client.shutdown().await;
            }
        });
    }
}

#[test]
fn test_clients_create_sign_close() {
    let deployment = Deployment::start(3);
    let chain = &deployment.chain;
    let keep = deployment.create_keep();

    let public_keys = chain.submitted_public_keys(keep);
    assert_eq!(public_keys.len(), 3);
    let public_key = public_keys[0].1;
    for client in &deployment.clients {
        assert!(client.registry().contains(keep));
        assert_eq!(client.registry().signers(keep)[0].public_key(), public_key);
    }
    assert_eq!(chain.signature_subscriptions(keep), 3);
    assert_eq!(chain.keep_closed_subscriptions(keep), 3);

    let digest = digest(b"keep request");
    chain.request_signature(keep, digest).unwrap();
    assert!(block_on_with_timeout(eventually(|| {
        chain.submitted_signatures(keep).len() == 3
    })));
    for (_, signature) in chain.submitted_signatures(keep) {
        check_signature(&public_key, &digest, &signature);
    }

    chain.close_keep(keep).unwrap();
    assert!(block_on_with_timeout(eventually(|| {
        deployment.clients.iter().all(|c| !c.is_monitoring(keep))
    })));
    for client in &deployment.clients {
        let mut seen = Vec::new();
        client.registry().for_each_keep(|k, _| seen.push(k));
        assert!(!seen.contains(&keep));
    }
    assert_eq!(chain.signature_subscriptions(keep), 0);
    assert_eq!(chain.keep_closed_subscriptions(keep), 0);
    // No more requests reach a closed keep.
    assert!(chain.request_signature(keep, digest).is_err());

    deployment.shutdown();
}

#[test]
fn test_close_during_signing() {
    let deployment = Deployment::start(3);
    let chain = &deployment.chain;
    let keep = deployment.create_keep();

    let digest = digest(b"in flight");
    let session = SessionId::signing(keep, &digest);
    let network = &deployment.network;
    network.hold(&session);
    chain.request_signature(keep, digest).unwrap();
    assert!(block_on_with_timeout(eventually(|| network.subscribers(&session) == 3)));

    chain.close_keep(keep).unwrap();
    assert!(block_on_with_timeout(eventually(|| {
        deployment
            .clients
            .iter()
            .all(|c| !c.registry().contains(keep) && !c.is_monitoring(keep))
    })));
    // Every session is still waiting on the first round.
    assert!(chain.submitted_signatures(keep).is_empty());
    assert_eq!(network.subscribers(&session), 3);

    network.release(&session);
    assert!(block_on_with_timeout(eventually(|| {
        chain.submitted_signatures(keep).len() == 3
    })));
    let public_key = chain.submitted_public_keys(keep)[0].1;
    for (_, signature) in chain.submitted_signatures(keep) {
        check_signature(&public_key, &digest, &signature);
    }
    assert!(deployment.clients.iter().all(|c| !c.is_monitoring(keep)));

    deployment.shutdown();
}

#[test]
fn test_client_ignores_foreign_keeps() {
    let deployment = Deployment::start(1);
    let chain = &deployment.chain;
    let keep = chain.create_keep(vec![operator(0x77)]);
    let own = deployment.create_keep();

    let client = &deployment.clients[0];
    assert!(client.registry().contains(own));
    assert!(!client.registry().contains(keep));
    assert!(!client.is_monitoring(keep));
    assert_eq!(chain.signature_subscriptions(keep), 0);

    deployment.shutdown();
}

#[test]
fn test_startup_reconciles_stored_keeps() {
    let chain = LocalChain::new();
    let me = operator(1);
    let store = Arc::new(MemoryKeyStore::new());

    let active: Vec<Address> = (0..3).map(|_| chain.open_keep(vec![me])).collect();
    let closed = chain.open_keep(vec![me]);
    chain.close_keep(closed).unwrap();
    let unreachable = chain.open_keep(vec![me]);
    chain.fail_activity_checks(unreachable).unwrap();
    let corrupt = chain.open_keep(vec![me]);
    let foreign = chain.open_keep(vec![operator(0x77)]);

    for keep in active.iter().chain([&closed, &unreachable, &foreign]) {
        store.save(*keep, &single_signer(*keep, None).to_bytes()).unwrap();
    }
    store.save(corrupt, b"not a signer").unwrap();

    let cancel = Cancellation::new();
    let client = block_on_with_timeout(Client::initialize(
        &cancel,
        &ClientConfig::default(),
        Arc::new(chain.connect(me)),
        Arc::new(LocalNetwork::new()),
        store.clone(),
    ))
    .unwrap();

    for keep in &active {
        assert!(client.registry().contains(*keep));
        assert!(client.is_monitoring(*keep));
        assert_eq!(chain.signature_subscriptions(*keep), 1);
    }
    assert!(!client.registry().contains(closed));
    assert_eq!(store.archived(), vec![closed]);
    // A keep whose state can't be read is kept, but not watched.
    assert!(client.registry().contains(unreachable));
    assert!(!client.is_monitoring(unreachable));
    assert!(!client.registry().contains(corrupt));
    // A keep the chain doesn't list us in is kept, but not watched.
    assert!(client.registry().contains(foreign));
    assert!(!client.is_monitoring(foreign));
    assert_eq!(chain.signature_subscriptions(foreign), 0);
    assert_eq!(client.registry().len(), 5);

    block_on_with_timeout(client.shutdown());
}

#[test]
fn test_client_registers_for_applications() {
    let chain = LocalChain::new();
    let me = operator(1);
    let application = operator(0xaa);
    chain.set_eligible(application, me, true);

    let config = ClientConfig {
        sanctioned_applications: vec![application],
        registration_check_interval_blocks: 1,
        ..ClientConfig::default()
    };
    let handle: Arc<dyn ChainHandle> = Arc::new(chain.connect(me));
    let client = block_on_with_timeout(Client::initialize(
        &Cancellation::new(),
        &config,
        handle,
        Arc::new(LocalNetwork::new()),
        Arc::new(MemoryKeyStore::new()),
    ))
    .unwrap();

    let registered = block_on_with_timeout(async {
        for _ in 0..200 {
            if chain.is_registered(application, me)
                && client.registration_state(application)
                    == Some(RegistrationState::Monitoring)
            {
                return true;
            }
            chain.mine_block();
            smol::Timer::after(Duration::from_millis(5)).await;
        }
        false
    });
    assert!(registered);
    assert_eq!(chain.register_calls(application, me), 1);
    assert_eq!(client.registration_state(operator(0xbb)), None);

    block_on_with_timeout(client.shutdown());
}

#[test]
fn test_client_keeps_signers_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("keys");
    let config_path = dir.path().join("client.toml");
    std::fs::write(&config_path, format!("[storage]\ndata_dir = {:?}\n", data_dir)).unwrap();
    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.storage.data_dir, data_dir);

    let chain = LocalChain::new();
    let network = LocalNetwork::new();
    let me = operator(1);
    let start = || {
        block_on_with_timeout(Client::from_config(
            &Cancellation::new(),
            &config,
            Arc::new(chain.connect(me)),
            Arc::new(network.clone()),
        ))
        .unwrap()
    };

    let client = start();
    let keep = chain.create_keep(vec![me]);
    assert!(block_on_with_timeout(eventually(|| client.is_monitoring(keep))));
    block_on_with_timeout(client.shutdown());

    let store = FileKeyStore::open(&data_dir).unwrap();
    let records = store.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].keep, keep);

    // A new client picks the signer up from disk, and can sign with it.
    let client = start();
    assert!(client.registry().contains(keep));
    assert!(client.is_monitoring(keep));
    let public_key = client.registry().signers(keep)[0].public_key();
    assert_eq!(chain.submitted_public_keys(keep)[0].1, public_key);

    let digest = digest(b"after restart");
    chain.request_signature(keep, digest).unwrap();
    assert!(block_on_with_timeout(eventually(|| {
        !chain.submitted_signatures(keep).is_empty()
    })));
    check_signature(&public_key, &digest, &chain.submitted_signatures(keep)[0].1);

    chain.close_keep(keep).unwrap();
    assert!(block_on_with_timeout(eventually(|| !client.is_monitoring(keep))));
    assert!(store.list().unwrap().is_empty());
    assert_eq!(store.archived().unwrap(), vec![keep]);
    block_on_with_timeout(client.shutdown());
}
