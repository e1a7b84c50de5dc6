use super::*;
use crate::{Error, ProbeTargetLister};
use istio_ingress_controller_core::ProbeTarget;
use istio_ingress_controller_k8s_api::{
    istio::gateway::{ServerTlsSettings, TlsMode},
    EndpointAddress, EndpointPort, EndpointSubset, ServicePort,
};
use maplit::btreeset;
use pretty_assertions::assert_eq;

const GATEWAY: &str = "knative-serving/knative-ingress-gateway";

fn gateways() -> GatewaysByVisibility {
    GatewaysByVisibility {
        external: btreeset! {GATEWAY.to_string()},
        cluster_local: Default::default(),
    }
}

fn ingress() -> Ingress {
    make_ingress(
        vec![make_rule(
            &["hello.example.com", "a.example.com"],
            Visibility::ExternalIp,
        )],
        vec![],
    )
}

fn with_tls(mut server: Server, tls: ServerTlsSettings) -> Server {
    server.tls = Some(tls);
    server
}

fn gateway_service() -> Service {
    let mut svc = make_gateway_service("istio-system", "istio-ingressgateway");
    svc.spec.get_or_insert_with(Default::default).ports = Some(vec![
        ServicePort {
            name: Some("http2".to_string()),
            port: 80,
            ..Default::default()
        },
        ServicePort {
            name: Some("https".to_string()),
            port: 443,
            ..Default::default()
        },
    ]);
    svc
}

fn gateway_endpoints() -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            namespace: Some("istio-system".to_string()),
            name: Some("istio-ingressgateway".to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![
                EndpointAddress {
                    ip: "10.0.0.1".to_string(),
                    ..Default::default()
                },
                EndpointAddress {
                    ip: "10.0.0.2".to_string(),
                    ..Default::default()
                },
            ]),
            ports: Some(vec![
                EndpointPort {
                    name: Some("http2".to_string()),
                    port: 8080,
                    ..Default::default()
                },
                EndpointPort {
                    name: Some("https".to_string()),
                    port: 8443,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }]),
    }
}

fn cluster() -> FakeCluster {
    let cluster = FakeCluster::default();
    cluster.gateways.write().apply(make_gateway(
        "knative-serving",
        "knative-ingress-gateway",
        vec![
            make_server("http-server", "HTTP", 80),
            make_server("http-server-copy", "HTTP", 80),
            with_tls(
                make_server("redirect", "HTTP", 8081),
                ServerTlsSettings {
                    https_redirect: true,
                    ..Default::default()
                },
            ),
            with_tls(
                make_server("test-ns/reconciling-ingress:0", "HTTPS", 443),
                ServerTlsSettings {
                    mode: TlsMode::Simple,
                    ..Default::default()
                },
            ),
            with_tls(
                make_server("mutual", "HTTPS", 9443),
                ServerTlsSettings {
                    mode: TlsMode::Mutual,
                    ..Default::default()
                },
            ),
            make_server("tcp", "TCP", 9000),
            make_server("unknown-port", "HTTP", 8888),
        ],
    ));
    cluster.services.write().apply(gateway_service());
    cluster.endpoints.write().apply(gateway_endpoints());
    cluster
}

fn lister(cluster: &FakeCluster) -> ProbeTargetLister {
    ProbeTargetLister::new(&cluster.stores(), CLUSTER_DOMAIN)
}

#[test]
fn lists_probeable_servers() {
    let cluster = cluster();
    let targets = lister(&cluster)
        .list_probe_targets(&ingress(), &gateways())
        .expect("targets must be listed");

    let pod_ips = btreeset! {"10.0.0.1".to_string(), "10.0.0.2".to_string()};
    assert_eq!(
        targets,
        vec![
            ProbeTarget {
                pod_ips: pod_ips.clone(),
                pod_port: "8080".to_string(),
                port: "80".to_string(),
                urls: vec!["http://a.example.com:80/healthz".parse().unwrap()],
            },
            ProbeTarget {
                pod_ips,
                pod_port: "8443".to_string(),
                port: "443".to_string(),
                urls: vec!["https://a.example.com:443/healthz".parse().unwrap()],
            },
        ]
    );
}

#[test]
fn skips_gateway_without_service() {
    let cluster = cluster();
    cluster
        .services
        .write()
        .delete("istio-system".to_string(), "istio-ingressgateway".to_string());
    let targets = lister(&cluster)
        .list_probe_targets(&ingress(), &gateways())
        .expect("targets must be listed");
    assert!(targets.is_empty());
}

#[test]
fn ignores_gateways_without_hosts() {
    let cluster = FakeCluster::default();
    let local_only = GatewaysByVisibility {
        external: Default::default(),
        cluster_local: btreeset! {GATEWAY.to_string()},
    };
    let targets = lister(&cluster)
        .list_probe_targets(&ingress(), &local_only)
        .expect("targets must be listed");
    assert!(targets.is_empty());
}

#[test]
fn fails_on_unqualified_gateway() {
    let cluster = cluster();
    let gateways = GatewaysByVisibility {
        external: btreeset! {"knative-ingress-gateway".to_string()},
        cluster_local: Default::default(),
    };
    let error = lister(&cluster)
        .list_probe_targets(&ingress(), &gateways)
        .expect_err("listing must fail");
    assert!(matches!(error, Error::UnqualifiedGateway(_)), "{error}");
}

#[test]
fn fails_on_missing_gateway() {
    let cluster = FakeCluster::default();
    let error = lister(&cluster)
        .list_probe_targets(&ingress(), &gateways())
        .expect_err("listing must fail");
    assert!(matches!(error, Error::GatewayNotFound { .. }), "{error}");
}

#[test]
fn fails_on_missing_endpoints() {
    let cluster = cluster();
    cluster
        .endpoints
        .write()
        .delete("istio-system".to_string(), "istio-ingressgateway".to_string());
    let error = lister(&cluster)
        .list_probe_targets(&ingress(), &gateways())
        .expect_err("listing must fail");
    assert!(matches!(error, Error::EndpointsNotFound { .. }), "{error}");
}
