use chrono::{SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Selects the ingress implementation responsible for an Ingress.
pub const INGRESS_CLASS_ANNOTATION: &str = "networking.knative.dev/ingress.class";
pub const ISTIO_INGRESS_CLASS: &str = "istio.ingress.networking.knative.dev";

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_NETWORK_CONFIGURED: &str = "NetworkConfigured";
pub const CONDITION_LOAD_BALANCER_READY: &str = "LoadBalancerReady";

const DEPENDENT_CONDITIONS: [&str; 2] = [CONDITION_NETWORK_CONFIGURED, CONDITION_LOAD_BALANCER_READY];

/// A Knative networking Ingress: a set of host rules routed to weighted
/// backend splits, optionally terminated with TLS.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "networking.internal.knative.dev",
    version = "v1alpha1",
    kind = "Ingress",
    status = "IngressStatus",
    shortname = "kingress",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTls>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<IngressRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_option: Option<HttpOption>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    #[serde(default)]
    pub hosts: Vec<String>,
    pub secret_name: String,
    pub secret_namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub visibility: Visibility,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpIngressRuleValue>,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum Visibility {
    #[default]
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    ClusterLocal,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum HttpOption {
    Enabled,
    Redirected,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct HttpIngressRuleValue {
    #[serde(default)]
    pub paths: Vec<HttpIngressPath>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressPath {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rewrite_host: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, HeaderMatch>,

    #[serde(default)]
    pub splits: Vec<IngressBackendSplit>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct HeaderMatch {
    pub exact: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressBackendSplit {
    #[serde(flatten)]
    pub backend: IngressBackend,

    #[serde(default)]
    pub percent: i32,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressBackend {
    #[serde(default)]
    pub service_namespace: String,
    pub service_name: String,
    pub service_port: IntOrString,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_load_balancer: Option<LoadBalancerStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_load_balancer: Option<LoadBalancerStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub ingress: Vec<LoadBalancerIngressStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerIngressStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_internal: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mesh_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

// === impl Ingress ===

impl Ingress {
    /// Returns true when the Ingress asks to be handled by this controller.
    pub fn is_istio_class(&self) -> bool {
        self.annotations()
            .get(INGRESS_CLASS_ANNOTATION)
            .map_or(false, |class| class == ISTIO_INGRESS_CLASS)
    }

    /// Fills in values the API server leaves unset.
    pub fn set_defaults(&mut self) {
        let namespace = self.namespace().unwrap_or_default();
        for rule in self.spec.rules.iter_mut() {
            for path in rule.http.iter_mut().flat_map(|http| http.paths.iter_mut()) {
                if let [split] = path.splits.as_mut_slice() {
                    if split.percent == 0 {
                        split.percent = 100;
                    }
                }
                for split in path.splits.iter_mut() {
                    if split.backend.service_namespace.is_empty() {
                        split.backend.service_namespace = namespace.clone();
                    }
                }
            }
        }
    }

    /// Returns true when the status reflects the current generation and is Ready.
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map_or(false, |status| {
            status.observed_generation.is_some()
                && status.observed_generation == self.metadata.generation
                && status.is_ready()
        })
    }

    pub fn status_mut(&mut self) -> &mut IngressStatus {
        self.status.get_or_insert_with(Default::default)
    }

    pub fn rules_for_visibility(&self, visibility: Visibility) -> impl Iterator<Item = &IngressRule> {
        self.spec
            .rules
            .iter()
            .filter(move |rule| rule.visibility == visibility)
    }

    /// Returns true when any rule is reachable from outside the cluster.
    pub fn is_public(&self) -> bool {
        self.rules_for_visibility(Visibility::ExternalIp)
            .next()
            .is_some()
    }

    /// Returns the TLS entries whose hosts overlap the hosts of rules with
    /// the given visibility, in declaration order and without duplicates.
    pub fn tls_for_visibility(&self, visibility: Visibility) -> Vec<IngressTls> {
        let mut tls = Vec::<IngressTls>::new();
        for rule in self.rules_for_visibility(visibility) {
            for entry in self.spec.tls.iter() {
                if tls.contains(entry) {
                    continue;
                }
                if entry.hosts.iter().any(|host| rule.hosts.contains(host)) {
                    tls.push(entry.clone());
                }
            }
        }
        tls
    }

    /// Resets readiness when the spec has changed since it was last observed.
    pub fn reset_stale_status(&mut self) {
        let generation = self.metadata.generation;
        let status = self.status_mut();
        if status.observed_generation != generation {
            status.set_condition(
                CONDITION_LOAD_BALANCER_READY,
                ConditionStatus::Unknown,
                None,
                None,
            );
            status.set_condition(CONDITION_NETWORK_CONFIGURED, ConditionStatus::Unknown, None, None);
        }
    }
}

// === impl IngressStatus ===

impl IngressStatus {
    pub fn initialize_conditions(&mut self) {
        for type_ in DEPENDENT_CONDITIONS.iter().chain(Some(&CONDITION_READY)) {
            if self.condition(type_).is_none() {
                self.conditions.push(Condition {
                    type_: type_.to_string(),
                    status: ConditionStatus::Unknown,
                    reason: None,
                    message: None,
                    last_transition_time: Some(now()),
                });
            }
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_ready(&self) -> bool {
        self.condition(CONDITION_READY)
            .map_or(false, |c| c.status == ConditionStatus::True)
    }

    pub fn mark_network_configured(&mut self) {
        self.set_condition(CONDITION_NETWORK_CONFIGURED, ConditionStatus::True, None, None);
    }

    pub fn mark_resource_not_owned(&mut self, kind: &str, name: &str) {
        self.set_condition(
            CONDITION_NETWORK_CONFIGURED,
            ConditionStatus::False,
            Some("NotOwned"),
            Some(&format!(
                "There is an existing {kind} {name:?} that we do not own."
            )),
        );
    }

    pub fn mark_load_balancer_ready(
        &mut self,
        public: Vec<LoadBalancerIngressStatus>,
        private: Vec<LoadBalancerIngressStatus>,
    ) {
        self.public_load_balancer = Some(LoadBalancerStatus { ingress: public });
        self.private_load_balancer = Some(LoadBalancerStatus { ingress: private });
        self.set_condition(CONDITION_LOAD_BALANCER_READY, ConditionStatus::True, None, None);
    }

    pub fn mark_load_balancer_not_ready(&mut self) {
        self.set_condition(
            CONDITION_LOAD_BALANCER_READY,
            ConditionStatus::Unknown,
            Some("Uninitialized"),
            Some("Waiting for load balancer to be ready"),
        );
    }

    pub fn mark_ingress_not_ready(&mut self, reason: &str, message: &str) {
        self.set_ready(ConditionStatus::Unknown, Some(reason), Some(message));
    }

    /// Sets a dependent condition and recomputes Ready from the dependents.
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: Option<&str>,
        message: Option<&str>,
    ) {
        self.upsert(type_, status, reason, message);
        if type_ == CONDITION_READY {
            return;
        }

        let dependents = DEPENDENT_CONDITIONS
            .iter()
            .filter_map(|t| self.condition(t))
            .collect::<Vec<_>>();
        let (status, reason, message) = if let Some(failed) = dependents
            .iter()
            .find(|c| c.status == ConditionStatus::False)
        {
            (ConditionStatus::False, failed.reason.clone(), failed.message.clone())
        } else if dependents.len() == DEPENDENT_CONDITIONS.len()
            && dependents.iter().all(|c| c.status == ConditionStatus::True)
        {
            (ConditionStatus::True, None, None)
        } else {
            let pending = dependents
                .iter()
                .find(|c| c.status == ConditionStatus::Unknown);
            (
                ConditionStatus::Unknown,
                pending.and_then(|c| c.reason.clone()),
                pending.and_then(|c| c.message.clone()),
            )
        };
        self.set_ready(status, reason.as_deref(), message.as_deref());
    }

    fn set_ready(&mut self, status: ConditionStatus, reason: Option<&str>, message: Option<&str>) {
        self.upsert(CONDITION_READY, status, reason, message);
    }

    fn upsert(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: Option<&str>,
        message: Option<&str>,
    ) {
        let reason = reason.map(ToString::to_string);
        let message = message.map(ToString::to_string);
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(c) if c.status == status && c.reason == reason && c.message == message => {}
            Some(c) => {
                if c.status != status {
                    c.last_transition_time = Some(now());
                }
                c.status = status;
                c.reason = reason;
                c.message = message;
            }
            None => self.conditions.push(Condition {
                type_: type_.to_string(),
                status,
                reason,
                message,
                last_transition_time: Some(now()),
            }),
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn split(name: &str, percent: i32) -> IngressBackendSplit {
        IngressBackendSplit {
            backend: IngressBackend {
                service_namespace: String::new(),
                service_name: name.to_string(),
                service_port: IntOrString::Int(80),
            },
            percent,
            append_headers: Default::default(),
        }
    }

    fn ingress(rules: Vec<IngressRule>, tls: Vec<IngressTls>) -> Ingress {
        let mut ing = Ingress::new(
            "hello",
            IngressSpec {
                tls,
                rules,
                http_option: None,
            },
        );
        ing.metadata.namespace = Some("default".to_string());
        ing
    }

    fn rule(hosts: &[&str], visibility: Visibility) -> IngressRule {
        IngressRule {
            hosts: hosts.iter().map(ToString::to_string).collect(),
            visibility,
            http: None,
        }
    }

    fn tls(hosts: &[&str], name: &str) -> IngressTls {
        IngressTls {
            hosts: hosts.iter().map(ToString::to_string).collect(),
            secret_name: name.to_string(),
            secret_namespace: "default".to_string(),
        }
    }

    #[test]
    fn defaults_single_split_to_full_weight() {
        let mut ing = ingress(
            vec![IngressRule {
                http: Some(HttpIngressRuleValue {
                    paths: vec![HttpIngressPath {
                        splits: vec![split("a", 0)],
                        ..Default::default()
                    }],
                }),
                ..rule(&["a.example.com"], Visibility::ExternalIp)
            }],
            vec![],
        );
        ing.set_defaults();

        let split = &ing.spec.rules[0].http.as_ref().unwrap().paths[0].splits[0];
        assert_eq!(split.percent, 100);
        assert_eq!(split.backend.service_namespace, "default");
    }

    #[test]
    fn visibility_defaults_to_external() {
        let rule: IngressRule = serde_json::from_value(serde_json::json!({
            "hosts": ["a.example.com"],
        }))
        .unwrap();
        assert_eq!(rule.visibility, Visibility::ExternalIp);

        let rule: IngressRule = serde_json::from_value(serde_json::json!({
            "hosts": ["a.default"],
            "visibility": "ClusterLocal",
        }))
        .unwrap();
        assert_eq!(rule.visibility, Visibility::ClusterLocal);
    }

    #[test]
    fn tls_for_visibility_dedups_in_declaration_order() {
        let ing = ingress(
            vec![
                rule(&["a.example.com", "b.example.com"], Visibility::ExternalIp),
                rule(&["b.example.com"], Visibility::ExternalIp),
                rule(&["a.default.svc.cluster.local"], Visibility::ClusterLocal),
            ],
            vec![
                tls(&["b.example.com"], "b"),
                tls(&["a.example.com"], "a"),
                tls(&["a.default.svc.cluster.local"], "local"),
            ],
        );

        assert_eq!(
            ing.tls_for_visibility(Visibility::ExternalIp),
            vec![tls(&["b.example.com"], "b"), tls(&["a.example.com"], "a")],
        );
        assert_eq!(
            ing.tls_for_visibility(Visibility::ClusterLocal),
            vec![tls(&["a.default.svc.cluster.local"], "local")],
        );
    }

    #[test]
    fn ready_follows_dependents() {
        let mut status = IngressStatus::default();
        status.initialize_conditions();
        assert!(!status.is_ready());

        status.mark_network_configured();
        assert!(!status.is_ready());

        status.mark_load_balancer_ready(vec![], vec![]);
        assert!(status.is_ready());

        status.mark_resource_not_owned("VirtualService", "hello");
        let ready = status.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some("NotOwned"));
        assert_eq!(
            ready.message.as_deref(),
            Some("There is an existing VirtualService \"hello\" that we do not own."),
        );
    }

    #[test]
    fn ready_requires_observed_generation() {
        let mut ing = ingress(vec![], vec![]);
        ing.metadata.generation = Some(2);
        let status = ing.status_mut();
        status.initialize_conditions();
        status.mark_network_configured();
        status.mark_load_balancer_ready(vec![], vec![]);
        status.observed_generation = Some(1);
        assert!(!ing.is_ready());

        ing.status_mut().observed_generation = Some(2);
        assert!(ing.is_ready());
    }

    #[test]
    fn class_annotation() {
        let mut ing = ingress(vec![], vec![]);
        assert!(!ing.is_istio_class());
        ing.annotations_mut().insert(
            INGRESS_CLASS_ANNOTATION.to_string(),
            ISTIO_INGRESS_CLASS.to_string(),
        );
        assert!(ing.is_istio_class());
    }
}
