//! End-to-end install and add-node runs against a scripted cluster.

#![allow(clippy::unwrap_used)]

mod common;

use common::{member_list, TestCluster};
use kubesmith_control::{orchestrator, OrchestratorError, Role};

const THREE_MASTERS_TWO_WORKERS: &[(&str, &str, Role)] = &[
    ("m1", "10.0.0.1", Role::Master),
    ("m2", "10.0.0.2", Role::Master),
    ("m3", "10.0.0.3", Role::Master),
    ("w1", "10.0.0.11", Role::Worker),
    ("w2", "10.0.0.12", Role::Worker),
];

fn multi_master() -> TestCluster {
    TestCluster::with_config(THREE_MASTERS_TWO_WORKERS, |config| {
        config.keepalived.enabled = true;
        config.keepalived.virtual_ip = Some("10.0.0.100".parse().unwrap());
    })
    .healthy()
}

#[tokio::test]
async fn multi_master_install_runs_in_order() {
    let cluster = multi_master();

    orchestrator::install(&cluster.ctx).await.unwrap();

    // Every node is prepared before etcd starts, and etcd is healthy before
    // kubeadm runs.
    let last_containerd = cluster.last_on("10.0.0.12", "containerd config default").unwrap();
    let etcd_started = cluster.first_on("10.0.0.1", "systemctl start --no-block etcd").unwrap();
    let quorum = cluster.first_on("10.0.0.1", "member list").unwrap();
    let init = cluster.first_on("10.0.0.1", "sudo kubeadm init --config").unwrap();
    assert!(last_containerd < etcd_started);
    assert!(etcd_started < quorum && quorum < init);

    // Masters join strictly in order, then the workers.
    let m2 = cluster.first_on("10.0.0.2", "sudo kubeadm join").unwrap();
    let m3 = cluster.first_on("10.0.0.3", "sudo kubeadm join").unwrap();
    let w1 = cluster.first_on("10.0.0.11", "sudo kubeadm join").unwrap();
    let w2 = cluster.first_on("10.0.0.12", "sudo kubeadm join").unwrap();
    assert!(init < m2 && m2 < m3 && m3 < w1 && w1 < w2);

    // m2 is patched and restarted before m3 starts joining.
    let m2_kubelet = cluster.first_on("10.0.0.2", "systemctl restart kubelet").unwrap();
    assert!(m2 < m2_kubelet && m2_kubelet < m3);

    assert!(cluster
        .runner
        .ran("--apiserver-advertise-address=10.0.0.3"));
    assert_eq!(cluster.count_on("10.0.0.11", "--apiserver-advertise-address"), 0);

    // Convergence restarts the runtime everywhere after the last join.
    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.11", "10.0.0.12"] {
        assert!(cluster.last_on(ip, "systemctl restart containerd").unwrap() > w2);
    }
    let converged = cluster
        .first_on("10.0.0.1", "kubectl get pods --no-headers -n kube-system")
        .unwrap();
    assert!(converged > w2);

    // The kubeadm config points at the virtual IP and external etcd.
    let kubeadm_config = cluster
        .runner
        .stdin_of("kubesmith-kubeadm-config.yaml")
        .unwrap();
    assert!(kubeadm_config.contains("10.0.0.100:6443"));
    assert!(kubeadm_config.contains("https://10.0.0.3:2379"));

    // etcd certificates reach masters only.
    assert_eq!(cluster.count_on("10.0.0.3", "-m 0600 \"$staging\" /etc/etcd/pki/etcd-key.pem"), 1);
    assert_eq!(cluster.count_on("10.0.0.11", "/etc/etcd/pki"), 0);

    // keepalived runs on masters only.
    assert_eq!(cluster.runner.count("systemctl restart keepalived"), 3);

    // Teardown ran.
    assert!(cluster.runner.ran("rm -rf $HOME/.kubesmith/tmp"));
    assert!(cluster.runner.connected().is_empty());
}

#[tokio::test]
async fn quorum_timeout_stops_before_kubeadm() {
    let cluster = multi_master();
    let masters: Vec<_> = cluster
        .ctx
        .plan()
        .masters()
        .map(|m| (m.hostname.clone(), m.ip))
        .collect();
    cluster.runner.on("member list", &member_list(&masters, 2));

    let err = orchestrator::install(&cluster.ctx).await.unwrap_err();

    match err {
        OrchestratorError::QuorumTimeout {
            attempts,
            started,
            expected,
        } => {
            assert_eq!(attempts, 5);
            assert_eq!(started, 2);
            assert_eq!(expected, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(cluster.runner.count("member list"), 5);
    assert!(!cluster.runner.ran("kubeadm init"));
    assert!(cluster.runner.ran("rm -rf $HOME/.kubesmith/tmp"));
}

#[tokio::test]
async fn single_master_uses_stacked_etcd() {
    let cluster = TestCluster::new(&[
        ("m1", "10.0.0.1", Role::Master),
        ("w1", "10.0.0.11", Role::Worker),
    ])
    .healthy();

    orchestrator::install(&cluster.ctx).await.unwrap();

    assert!(!cluster.runner.ran("member list"));
    assert!(cluster.runner.ran("sudo rm -rf /var/lib/etcd"));
    let kubeadm_config = cluster
        .runner
        .stdin_of("kubesmith-kubeadm-config.yaml")
        .unwrap();
    assert!(!kubeadm_config.contains("external"));
    assert!(kubeadm_config.contains("10.0.0.1:6443"));

    // The worker gets the admin kubeconfig from the first master.
    assert!(cluster
        .first_on("10.0.0.1", "ops@10.0.0.11:.kube/config")
        .is_some());
    assert!(cluster.first_on("10.0.0.11", "sudo kubeadm join").is_some());
}

#[tokio::test]
async fn failed_join_is_reported_and_torn_down() {
    let cluster = multi_master();
    cluster
        .runner
        .fail_on(
            kubesmith_remote::Target::Node("10.0.0.3".parse().unwrap()),
            "sudo kubeadm join",
            1,
            "error execution phase preflight",
        );

    let err = orchestrator::install(&cluster.ctx).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::JoinFailed { ref node, .. } if node == "m3"));
    assert_eq!(cluster.count_on("10.0.0.11", "sudo kubeadm join"), 0);
    assert!(cluster.runner.ran("rm -rf $HOME/.kubesmith/tmp"));
}

#[tokio::test]
async fn added_worker_is_the_only_node_provisioned() {
    let cluster = TestCluster::new(&[
        ("m1", "10.0.0.1", Role::Master),
        ("w1", "10.0.0.11", Role::Worker),
        ("w2", "10.0.0.12", Role::Worker),
    ])
    .healthy();

    orchestrator::add_node(&cluster.ctx, "w2").await.unwrap();

    // Everyone learns the hostname; only w2 is provisioned and joined.
    assert_eq!(cluster.count_on("10.0.0.1", "'10.0.0.12 w2'"), 1);
    assert_eq!(cluster.count_on("10.0.0.12", "containerd config default"), 1);
    assert_eq!(cluster.count_on("10.0.0.11", "containerd config default"), 0);
    assert_eq!(cluster.count_on("10.0.0.1", "kubeadm init"), 0);
    assert_eq!(cluster.count_on("10.0.0.11", "sudo kubeadm join"), 0);

    let copied = cluster
        .first_on("10.0.0.1", "ops@10.0.0.12:.kube/config")
        .unwrap();
    let joined = cluster.first_on("10.0.0.12", "sudo kubeadm join").unwrap();
    assert!(copied < joined);
    assert_eq!(cluster.count_on("10.0.0.11", "systemctl restart containerd"), 0);
}

#[tokio::test]
async fn added_master_gets_fresh_certificates() {
    let cluster = TestCluster::new(&[
        ("m1", "10.0.0.1", Role::Master),
        ("m2", "10.0.0.2", Role::Master),
    ])
    .healthy();
    cluster.runner.on(
        "upload-certs",
        "[upload-certs] Using certificate key:\nfeedface",
    );
    cluster.runner.fail("sudo test -f /etc/etcd/pki/ca.pem", 1, "");

    orchestrator::add_node(&cluster.ctx, "m2").await.unwrap();

    assert!(cluster
        .runner
        .ran("token create --print-join-command --certificate-key feedface"));
    assert!(cluster.first_on("10.0.0.2", "--apiserver-advertise-address=10.0.0.2").is_some());
    assert_eq!(cluster.count_on("10.0.0.2", "/etc/etcd/pki"), 0);
}
