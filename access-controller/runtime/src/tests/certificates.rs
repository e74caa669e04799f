use super::{key, FakeIssuer, Fakes};
use crate::{
    certificates::{CertificateManager, Issuer, LeafRequest, CA_CERT, TLS_CERT},
    context::StaticContext,
    k8s::{
        labels,
        status::{ConditionStatus, StatusType},
        ByteString, Certificate, CertificateSpec, ObjectMeta, OwnerReference, Secret,
    },
    Error,
};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::{collections::BTreeSet, sync::Arc};

const NS: &str = "test";
const CA: &str = "skupper-site-ca";

fn owner(name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "skupper.io/v2alpha1".to_string(),
        kind: "SecuredAccess".to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        ..Default::default()
    }
}

fn leaf(subject: &str, hosts: &[&str]) -> LeafRequest {
    LeafRequest {
        ca: CA.to_string(),
        subject: subject.to_string(),
        hosts: hosts.iter().map(ToString::to_string).collect(),
        server: true,
        ..Default::default()
    }
}

fn issued(secret: &Secret) -> crate::certificates::ParsedCertificate {
    let pem = secret
        .data
        .as_ref()
        .and_then(|d| d.get(TLS_CERT))
        .expect("secret must hold a certificate");
    FakeIssuer.decode(&pem.0).expect("certificate must decode")
}

fn sorted(hosts: &[String]) -> Vec<String> {
    hosts.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Creates the site CA and delivers its secret.
async fn with_ca(fakes: &Fakes, certs: &mut CertificateManager) {
    let ca = key(NS, CA);
    certs
        .ensure_ca(&ca, CA, &[])
        .await
        .expect("CA certificate must be created");
    let cert = fakes.certificates.get_item(NS, CA).expect("CA certificate");
    certs
        .certificate_changed(&ca, Some(cert))
        .await
        .expect("CA secret must be issued");
    let secret = fakes.secrets.get_item(NS, CA).expect("CA secret");
    certs
        .secret_changed(&ca, Some(secret))
        .await
        .expect("CA secret must be accepted");
}

/// Delivers the certificate as stored by the API, as the watch would.
async fn deliver(fakes: &Fakes, certs: &mut CertificateManager, name: &str) -> Result<(), Error> {
    let cert = fakes.certificates.get_item(NS, name);
    certs.certificate_changed(&key(NS, name), cert).await
}

#[tokio::test]
async fn leaf_waits_for_its_ca() {
    let fakes = Fakes::new();
    let mut certs = fakes.certificate_manager();

    certs
        .ensure(&key(NS, "mysvc"), leaf("mysvc", &["mysvc", "mysvc.test"]), &[])
        .await
        .expect("certificate must be created");
    deliver(&fakes, &mut certs, "mysvc")
        .await
        .expect("a missing CA must not be retried");

    let cert = fakes.certificates.get_item(NS, "mysvc").unwrap();
    let ready = cert.ready_condition().expect("ready condition");
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "Pending");
    assert!(ready.message.contains("not found"), "{}", ready.message);
    assert!(!fakes.secrets.contains(NS, "mysvc"));

    with_ca(&fakes, &mut certs).await;

    let secret = fakes
        .secrets
        .get_item(NS, "mysvc")
        .expect("leaf secret must be issued once the CA exists");
    let parsed = issued(&secret);
    assert_eq!(parsed.subject, "mysvc");
    assert_eq!(parsed.dns_names, vec!["mysvc", "mysvc.test"]);

    let ca_secret = fakes.secrets.get_item(NS, CA).unwrap();
    assert_eq!(
        secret.data.as_ref().unwrap().get(CA_CERT),
        ca_secret.data.as_ref().unwrap().get(TLS_CERT),
    );
    let annotations = secret.metadata.annotations.unwrap();
    assert_eq!(annotations.get(labels::HOSTS).unwrap(), "mysvc,mysvc.test");
    assert!(annotations.contains_key(labels::CONTROLLED));

    let cert = fakes.certificates.get_item(NS, "mysvc").unwrap();
    assert_eq!(cert.ready_condition().unwrap().status, ConditionStatus::True);
    let status = cert.status.unwrap();
    assert_eq!(status.status.status_type, Some(StatusType::Ready));
    assert!(!status.expiration.is_empty());
}

#[tokio::test]
async fn hosts_are_tracked_per_owner() {
    let fakes = Fakes::new();
    let mut certs = fakes.certificate_manager();
    let k = key(NS, "shared");

    certs
        .ensure(&k, leaf("shared", &["a.example.com", "common"]), &[owner("a", "uid-a")])
        .await
        .unwrap();
    certs
        .ensure(&k, leaf("other-subject", &["b.example.com", "common"]), &[owner("b", "uid-b")])
        .await
        .unwrap();

    let cert = fakes.certificates.get_item(NS, "shared").unwrap();
    assert_eq!(
        sorted(&cert.spec.hosts),
        vec!["a.example.com", "b.example.com", "common"]
    );
    assert_eq!(cert.metadata.owner_references.as_ref().unwrap().len(), 2);
    assert_eq!(cert.spec.subject, "shared", "shared certificates keep their subject");

    // The first owner goes away and is dropped from the owner references.
    let mut departed = cert;
    departed
        .metadata
        .owner_references
        .as_mut()
        .unwrap()
        .retain(|o| o.uid != "uid-a");
    let departed = fakes.certificates.seed(departed);
    certs
        .certificate_changed(&k, Some(departed))
        .await
        .unwrap();

    let cert = fakes.certificates.get_item(NS, "shared").unwrap();
    assert_eq!(sorted(&cert.spec.hosts), vec!["b.example.com", "common"]);
    let annotations = cert.metadata.annotations.unwrap();
    assert!(!annotations.contains_key(&format!("{}uid-a", labels::OWNER_HOSTS_PREFIX)));
    assert!(annotations.contains_key(&format!("{}uid-b", labels::OWNER_HOSTS_PREFIX)));
}

fn owner_hosts(cert: &Certificate, uid: &str) -> Option<String> {
    cert.metadata
        .annotations
        .as_ref()?
        .get(&format!("{}{uid}", labels::OWNER_HOSTS_PREFIX))
        .cloned()
}

#[tokio::test]
async fn owner_replaces_its_own_hosts() {
    let fakes = Fakes::new();
    let mut certs = fakes.certificate_manager();
    let k = key(NS, "foo");
    let alice = [owner("alice", "alice-uid")];

    let mut request = leaf("s", &["aaa", "bbb"]);
    request.ca = "my-ca".to_string();
    certs.ensure(&k, request.clone(), &alice).await.unwrap();
    request.hosts = vec!["bbb".into(), "yyy".into(), "10.0.0.10".into()];
    certs.ensure(&k, request, &alice).await.unwrap();

    let cert = fakes.certificates.get_item(NS, "foo").unwrap();
    assert_eq!(sorted(&cert.spec.hosts), vec!["10.0.0.10", "bbb", "yyy"]);
    assert_eq!(
        owner_hosts(&cert, "alice-uid").as_deref(),
        Some("bbb,yyy,10.0.0.10")
    );
    assert_eq!(
        cert.metadata.annotations.as_ref().unwrap().get(labels::CONTROLLED),
        labels::controlled_annotations().get(labels::CONTROLLED)
    );
}

#[tokio::test]
async fn owners_keep_their_claims_until_pruned() {
    let fakes = Fakes::new();
    let mut certs = fakes.certificate_manager();
    let k = key(NS, "foo");

    certs
        .ensure(&k, leaf("s", &["aaa", "bbb"]), &[owner("alice", "alice-uid")])
        .await
        .unwrap();
    certs
        .ensure(&k, leaf("s", &["xxx", "yyy", "bbb"]), &[owner("bob", "bob-uid")])
        .await
        .unwrap();

    let cert = fakes.certificates.get_item(NS, "foo").unwrap();
    assert_eq!(sorted(&cert.spec.hosts), vec!["aaa", "bbb", "xxx", "yyy"]);
    assert_eq!(owner_hosts(&cert, "alice-uid").as_deref(), Some("aaa,bbb"));
    assert_eq!(owner_hosts(&cert, "bob-uid").as_deref(), Some("xxx,yyy,bbb"));

    // Alice no longer references the certificate; bbb is still claimed by bob.
    let mut departed = cert;
    departed
        .metadata
        .owner_references
        .as_mut()
        .unwrap()
        .retain(|o| o.uid != "alice-uid");
    let departed = fakes.certificates.seed(departed);
    certs.certificate_changed(&k, Some(departed)).await.unwrap();

    let cert = fakes.certificates.get_item(NS, "foo").unwrap();
    assert_eq!(sorted(&cert.spec.hosts), vec!["bbb", "xxx", "yyy"]);
    assert_eq!(owner_hosts(&cert, "alice-uid"), None);
    assert_eq!(owner_hosts(&cert, "bob-uid").as_deref(), Some("xxx,yyy,bbb"));
}

#[tokio::test]
async fn repeated_ensure_is_a_no_op() {
    let fakes = Fakes::new();
    let mut certs = fakes.certificate_manager();
    let k = key(NS, "mysvc");
    let owners = [owner("mysvc", "uid-1")];

    certs.ensure(&k, leaf("mysvc", &["mysvc"]), &owners).await.unwrap();
    fakes.certificates.clear_actions();
    certs.ensure(&k, leaf("mysvc", &["mysvc"]), &owners).await.unwrap();
    assert_eq!(fakes.certificates.actions(), Vec::<String>::new());
}

#[tokio::test]
async fn refuses_certificates_it_does_not_control() {
    let fakes = Fakes::new();
    let mut certs = fakes.certificate_manager();

    let mut foreign = Certificate::new(
        "foreign",
        CertificateSpec {
            subject: "foreign".to_string(),
            signing: true,
            ..Default::default()
        },
    );
    foreign.metadata.namespace = Some(NS.to_string());
    let foreign = fakes.certificates.seed(foreign);
    certs
        .certificate_changed(&key(NS, "foreign"), Some(foreign))
        .await
        .unwrap();

    let error = certs
        .ensure(&key(NS, "foreign"), leaf("foreign", &["foreign"]), &[])
        .await
        .expect_err("uncontrolled certificates must not be modified");
    assert!(matches!(error, Error::NotControlled(_)), "{error}");
}

#[tokio::test]
async fn leaves_uncontrolled_secrets_alone() {
    let fakes = Fakes::new();
    let mut certs = fakes.certificate_manager();

    let secret = fakes.secrets.seed(Secret {
        metadata: ObjectMeta {
            name: Some(CA.to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        data: Some(btreemap! {
            TLS_CERT.to_string() => ByteString(b"user provided".to_vec()),
        }),
        ..Default::default()
    });
    certs.secret_changed(&key(NS, CA), Some(secret)).await.unwrap();

    certs.ensure_ca(&key(NS, CA), CA, &[]).await.unwrap();
    fakes.secrets.clear_actions();
    deliver(&fakes, &mut certs, CA)
        .await
        .expect("an uncontrolled secret is reported in status, not retried");

    assert_eq!(fakes.secrets.actions(), Vec::<String>::new());
    let ready = fakes
        .certificates
        .get_item(NS, CA)
        .unwrap()
        .ready_condition()
        .cloned()
        .unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "Error");
    assert_eq!(ready.message, Error::SecretNotControlled.to_string());
}

#[tokio::test]
async fn regenerates_when_hosts_change() {
    let fakes = Fakes::new();
    let mut certs = fakes.certificate_manager();
    with_ca(&fakes, &mut certs).await;
    let k = key(NS, "mysvc");

    certs.ensure(&k, leaf("mysvc", &["mysvc"]), &[]).await.unwrap();
    deliver(&fakes, &mut certs, "mysvc").await.unwrap();
    let before = fakes.secrets.get_item(NS, "mysvc").unwrap();
    assert_eq!(issued(&before).dns_names, vec!["mysvc"]);

    certs
        .ensure(&k, leaf("mysvc", &["mysvc", "mysvc.example.com"]), &[])
        .await
        .unwrap();
    deliver(&fakes, &mut certs, "mysvc").await.unwrap();

    let after = fakes.secrets.get_item(NS, "mysvc").unwrap();
    assert_eq!(
        issued(&after).hosts(),
        ["mysvc", "mysvc.example.com"]
            .into_iter()
            .map(ToString::to_string)
            .collect::<BTreeSet<_>>()
    );
    assert_eq!(
        after.metadata.annotations.unwrap().get(labels::HOSTS).unwrap(),
        "mysvc,mysvc.example.com"
    );
}

#[tokio::test]
async fn reissues_deleted_secret() {
    let fakes = Fakes::new();
    let mut certs = fakes.certificate_manager();
    with_ca(&fakes, &mut certs).await;

    fakes.secrets.remove(NS, CA);
    certs.secret_changed(&key(NS, CA), None).await.unwrap();
    assert!(fakes.secrets.contains(NS, CA));
    assert!(certs.secret(&key(NS, CA)).is_some());
}

#[tokio::test]
async fn deleting_certificate_deletes_secret() {
    let fakes = Fakes::new();
    let mut certs = fakes.certificate_manager();
    with_ca(&fakes, &mut certs).await;

    fakes.certificates.remove(NS, CA);
    certs.certificate_changed(&key(NS, CA), None).await.unwrap();
    assert!(!fakes.secrets.contains(NS, CA));
    assert!(certs.definition(&key(NS, CA)).is_none());
}

#[tokio::test]
async fn delegated_certificates_are_not_issued() {
    let fakes = Fakes::new();
    let mut certs = CertificateManager::new(
        fakes.clients(),
        Arc::new(StaticContext::new("skupper", None)),
        Arc::new(FakeIssuer),
        Some("cert-manager".to_string()),
    );

    certs.ensure_ca(&key(NS, CA), CA, &[]).await.unwrap();
    deliver(&fakes, &mut certs, CA).await.unwrap();
    assert_eq!(fakes.secrets.len(), 0);
    assert!(certs.definition(&key(NS, CA)).is_some());
}

#[tokio::test]
async fn ignores_namespaces_it_does_not_watch() {
    let fakes = Fakes::new();
    let mut certs = CertificateManager::new(
        fakes.clients(),
        Arc::new(StaticContext::new("skupper", Some("other".to_string()))),
        Arc::new(FakeIssuer),
        None,
    );

    let mut cert = Certificate::new(
        CA,
        CertificateSpec {
            subject: CA.to_string(),
            signing: true,
            ..Default::default()
        },
    );
    cert.metadata.namespace = Some(NS.to_string());
    let cert = fakes.certificates.seed(cert);
    certs.certificate_changed(&key(NS, CA), Some(cert)).await.unwrap();
    assert_eq!(fakes.secrets.len(), 0);
}
