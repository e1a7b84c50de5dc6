use ahash::AHashMap;
use bytes::Bytes;
use futures::future;
use http::{header, StatusCode};
use http_body_util::Empty;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use istio_ingress_controller_core::{
    probe::{HASH_HEADER, PROBE_HEADER, PROBE_HEADER_VALUE},
    GatewaysByVisibility, ProbeInjector, ProbeTarget,
};
use istio_ingress_controller_k8s_api::Ingress;
use istio_ingress_controller_k8s_reconciler::{
    ProbeTargetLister, ResourceId, StatusManager, Stores,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    net::TcpStream,
    time::{self, Duration},
};

const USER_AGENT: &str = "Knative-Ingress-Probe";

/// Decides readiness by requesting the probe path from every gateway pod
/// that should serve an Ingress.
///
/// An Ingress is ready once every pod answers for the current generation,
/// which it signals by echoing the generation's hash.
pub struct Prober {
    lister: ProbeTargetLister,
    injector: Arc<dyn ProbeInjector>,
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,

    /// The hash each Ingress was last found ready with.
    ready: Mutex<AHashMap<ResourceId, String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

/// A single request to a single gateway pod.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Probe {
    scheme: Scheme,
    addr: String,
    host: String,
    path: String,
}

// === impl Prober ===

impl Prober {
    pub fn new(
        stores: &Stores,
        cluster_domain: impl Into<String>,
        injector: Arc<dyn ProbeInjector>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            lister: ProbeTargetLister::new(stores, cluster_domain),
            injector,
            client,
            timeout,
            ready: Default::default(),
        }
    }

    async fn probe(&self, probe: &Probe, hash: &str) -> bool {
        let result = match probe.scheme {
            Scheme::Http => self.get(probe, hash).await,
            Scheme::Https => self.connect(probe).await,
        };
        match result {
            Ok(ready) => ready,
            Err(error) => {
                tracing::debug!(addr = %probe.addr, host = %probe.host, %error, "Probe failed");
                false
            }
        }
    }

    async fn get(&self, probe: &Probe, hash: &str) -> anyhow::Result<bool> {
        let req = http::Request::get(format!("http://{}{}", probe.addr, probe.path))
            .header(header::HOST, &probe.host)
            .header(header::USER_AGENT, USER_AGENT)
            .header(PROBE_HEADER, PROBE_HEADER_VALUE)
            .body(Empty::new())?;
        let rsp = time::timeout(self.timeout, self.client.request(req)).await??;

        let echoed = rsp
            .headers()
            .get(HASH_HEADER)
            .and_then(|v| v.to_str().ok());
        if rsp.status() != StatusCode::OK || echoed != Some(hash) {
            tracing::debug!(addr = %probe.addr, host = %probe.host, status = %rsp.status(), ?echoed, "Gateway pod is not serving the current generation");
            return Ok(false);
        }
        Ok(true)
    }

    // TLS servers are only checked for reachability.
    async fn connect(&self, probe: &Probe) -> anyhow::Result<bool> {
        time::timeout(self.timeout, TcpStream::connect(probe.addr.as_str())).await??;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl StatusManager for Prober {
    async fn is_ready(
        &self,
        ing: &Ingress,
        gateways: &GatewaysByVisibility,
    ) -> anyhow::Result<bool> {
        let hash = self.injector.insert_probe(&mut ing.clone())?;
        let id = ResourceId::of(ing);
        let cached = self.ready.lock().get(&id) == Some(&hash);
        if cached {
            return Ok(true);
        }

        let targets = self.lister.list_probe_targets(ing, gateways)?;
        let probes = probes(&targets);
        let results = future::join_all(probes.iter().map(|p| self.probe(p, &hash))).await;
        let ready = results.into_iter().all(|ok| ok);
        tracing::debug!(ingress = %id, probes = probes.len(), ready, "Probed gateways");
        if ready {
            self.ready.lock().insert(id, hash);
        }
        Ok(ready)
    }

    fn forget(&self, ingress: &ResourceId) {
        self.ready.lock().remove(ingress);
    }
}

/// Expands targets into one probe per URL and pod.
fn probes(targets: &[ProbeTarget]) -> Vec<Probe> {
    let mut probes = Vec::new();
    for target in targets {
        for url in target.urls.iter() {
            let scheme = match url.scheme_str() {
                Some("http") => Scheme::Http,
                Some("https") => Scheme::Https,
                scheme => {
                    tracing::info!(%url, ?scheme, "Skipping URL with unsupported scheme");
                    continue;
                }
            };
            let Some(host) = url.authority() else {
                continue;
            };
            let path = url.path_and_query().map_or("/", |p| p.as_str());
            for ip in target.pod_ips.iter() {
                let addr = if ip.contains(':') {
                    format!("[{ip}]:{}", target.pod_port)
                } else {
                    format!("{ip}:{}", target.pod_port)
                };
                probes.push(Probe {
                    scheme,
                    addr,
                    host: host.to_string(),
                    path: path.to_string(),
                });
            }
        }
    }
    probes
}

#[cfg(test)]
mod tests {
    use super::*;
    use istio_ingress_controller_core::HashProbeInjector;
    use istio_ingress_controller_k8s_api::IngressSpec;
    use istio_ingress_controller_k8s_reconciler::Store;
    use maplit::btreeset;
    use pretty_assertions::assert_eq;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    fn prober() -> Prober {
        let stores = Stores {
            gateways: Store::shared(),
            virtual_services: Store::shared(),
            destination_rules: Store::shared(),
            secrets: Store::shared(),
            services: Store::shared(),
            endpoints: Store::shared(),
        };
        Prober::new(
            &stores,
            "cluster.local",
            Arc::new(HashProbeInjector),
            Duration::from_secs(5),
        )
    }

    /// Serves a single HTTP/1.1 response and returns the request it read.
    async fn serve_once(response: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut read = 0;
            loop {
                let n = conn.read(&mut buf[read..]).await.unwrap();
                read += n;
                if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            conn.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..read]).to_ascii_lowercase()
        });
        (addr, task)
    }

    fn http_probe(addr: String) -> Probe {
        Probe {
            scheme: Scheme::Http,
            addr,
            host: "hello.example.com:80".to_string(),
            path: "/healthz".to_string(),
        }
    }

    #[tokio::test]
    async fn ready_when_hash_is_echoed() {
        let (addr, server) = serve_once(
            "HTTP/1.1 200 OK\r\nk-network-hash: abc\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;

        assert!(prober().probe(&http_probe(addr), "abc").await);

        let request = server.await.unwrap();
        assert!(request.starts_with("get /healthz http/1.1\r\n"), "{request}");
        assert!(request.contains("host: hello.example.com:80\r\n"), "{request}");
        assert!(request.contains("k-network-probe: probe\r\n"), "{request}");
    }

    #[tokio::test]
    async fn not_ready_on_stale_hash() {
        let (addr, server) = serve_once(
            "HTTP/1.1 200 OK\r\nk-network-hash: old\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(!prober().probe(&http_probe(addr), "abc").await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn not_ready_when_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let probe = Probe {
            scheme: Scheme::Https,
            ..http_probe(addr)
        };
        assert!(!prober().probe(&probe, "abc").await);
    }

    #[tokio::test]
    async fn ready_without_targets() {
        let prober = prober();
        let ing = Ingress::new("hello", IngressSpec::default());
        let ready = prober
            .is_ready(&ing, &GatewaysByVisibility::default())
            .await
            .expect("probing must succeed");
        assert!(ready);
        assert_eq!(prober.ready.lock().len(), 1);

        prober.forget(&ResourceId::of(&ing));
        assert!(prober.ready.lock().is_empty());
    }

    #[test]
    fn expands_targets() {
        let targets = vec![ProbeTarget {
            pod_ips: btreeset! {"10.0.0.1".to_string(), "fd00::1".to_string()},
            pod_port: "8443".to_string(),
            port: "443".to_string(),
            urls: vec![
                "https://hello.example.com:443/healthz".parse().unwrap(),
                "ftp://hello.example.com/healthz".parse().unwrap(),
            ],
        }];
        assert_eq!(
            probes(&targets),
            vec![
                Probe {
                    scheme: Scheme::Https,
                    addr: "10.0.0.1:8443".to_string(),
                    host: "hello.example.com:443".to_string(),
                    path: "/healthz".to_string(),
                },
                Probe {
                    scheme: Scheme::Https,
                    addr: "[fd00::1]:8443".to_string(),
                    host: "hello.example.com:443".to_string(),
                    path: "/healthz".to_string(),
                },
            ]
        );
    }
}
