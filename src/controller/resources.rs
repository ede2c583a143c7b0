//! Kubernetes resource builders for ReviewCluster
//!
//! Each builder is a [`DependentResource`] over [`ReviewCluster`]: a pure
//! description of one managed object, registered in
//! [`review_cluster_workflow`]. The engine decides when they run and applies
//! what they return.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements as K8sResources, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ApiResource;
use kube::ResourceExt;

use super::dependent::{DependentResource, DesiredResource, Siblings};
use super::reconciler::ParentResource;
use super::workflow::{DependentNode, Workflow};
use crate::crd::{ResourceSpec, ReviewCluster};
use crate::error::{Error, Result};

pub const HTTP_PORT: i32 = 8080;
pub const SSH_PORT: i32 = 29418;
const REPOSITORY_MOUNT_PATH: &str = "/var/review/git";

/// Node names of the ReviewCluster workflow
pub mod nodes {
    pub const GIT_REPOSITORIES: &str = "git-repositories";
    pub const PRIMARY: &str = "primary";
    pub const PRIMARY_SERVICE: &str = "primary-service";
    pub const REPLICA: &str = "replica";
    pub const REPLICA_SERVICE: &str = "replica-service";
    pub const INGRESS: &str = "ingress";
    pub const GIT_GC: &str = "git-gc";
}

impl ParentResource for ReviewCluster {
    fn validate_spec(&self) -> std::result::Result<(), String> {
        self.spec.validate().map_err(|errors| {
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        })
    }
}

/// Get the standard labels for a ReviewCluster's resources
pub fn standard_labels(cluster: &ReviewCluster, component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        "review-server".to_string(),
    );
    labels.insert("app.kubernetes.io/instance".to_string(), cluster.name_any());
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        component.to_string(),
    );
    labels
}

/// Build the resource name for a given component
pub fn resource_name(cluster: &ReviewCluster, suffix: &str) -> String {
    format!("{}-{}", cluster.name_any(), suffix)
}

fn metadata(cluster: &ReviewCluster, name: String, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(standard_labels(cluster, component)),
        ..Default::default()
    }
}

fn builder_error(node: &str, message: impl Into<String>) -> Error {
    Error::BuilderError {
        node: node.to_string(),
        message: message.into(),
    }
}

/// Server role: the read-write primary or the read-only replicas
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

impl Role {
    fn component(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Replica => "replica",
        }
    }

    fn workload_node(self) -> &'static str {
        match self {
            Role::Primary => nodes::PRIMARY,
            Role::Replica => nodes::REPLICA,
        }
    }

    fn replicas(self, cluster: &ReviewCluster) -> Option<i32> {
        match self {
            Role::Primary => Some(cluster.spec.primary.replicas),
            Role::Replica => cluster.spec.replica.as_ref().map(|r| r.replicas),
        }
    }

    fn resources(self, cluster: &ReviewCluster) -> Option<&ResourceSpec> {
        match self {
            Role::Primary => cluster.spec.primary.resources.as_ref(),
            Role::Replica => cluster
                .spec
                .replica
                .as_ref()
                .and_then(|r| r.resources.as_ref()),
        }
    }
}

// ============================================================================
// PersistentVolumeClaim
// ============================================================================

/// Shared git repository volume mounted by every server and maintenance job
pub struct RepositoryVolume;

impl DependentResource<ReviewCluster> for RepositoryVolume {
    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<PersistentVolumeClaim>(&())
    }

    fn desired(&self, cluster: &ReviewCluster, _siblings: &Siblings) -> Result<DesiredResource> {
        DesiredResource::from_typed(&build_pvc(cluster))
    }
}

fn build_pvc(cluster: &ReviewCluster) -> PersistentVolumeClaim {
    let storage = &cluster.spec.storage;
    let mut requests = BTreeMap::new();
    requests.insert(
        "storage".to_string(),
        Quantity(storage.repository_size.clone()),
    );

    PersistentVolumeClaim {
        metadata: metadata(
            cluster,
            resource_name(cluster, nodes::GIT_REPOSITORIES),
            "storage",
        ),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            storage_class_name: Some(storage.read_write_many_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Claim name of the repository volume, preferring what was actually applied
fn repository_claim(cluster: &ReviewCluster, siblings: &Siblings) -> String {
    siblings
        .get(nodes::GIT_REPOSITORIES)
        .map(|pvc| pvc.name_any())
        .unwrap_or_else(|| resource_name(cluster, nodes::GIT_REPOSITORIES))
}

// ============================================================================
// StatefulSet
// ============================================================================

/// Review server StatefulSet for one role
pub struct ServerStatefulSet(pub Role);

impl DependentResource<ReviewCluster> for ServerStatefulSet {
    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<StatefulSet>(&())
    }

    fn precondition(&self, cluster: &ReviewCluster) -> Result<bool> {
        Ok(self.0.replicas(cluster).map(|r| r > 0).unwrap_or(false))
    }

    fn desired(&self, cluster: &ReviewCluster, siblings: &Siblings) -> Result<DesiredResource> {
        let replicas = self
            .0
            .replicas(cluster)
            .ok_or_else(|| builder_error(self.0.workload_node(), "role is not configured"))?;
        let claim = repository_claim(cluster, siblings);
        DesiredResource::from_typed(&build_statefulset(cluster, self.0, replicas, &claim))
    }
}

fn build_statefulset(cluster: &ReviewCluster, role: Role, replicas: i32, claim: &str) -> StatefulSet {
    let name = resource_name(cluster, role.component());
    let labels = standard_labels(cluster, role.component());

    StatefulSet {
        metadata: metadata(cluster, name.clone(), role.component()),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            service_name: name,
            template: build_pod_template(cluster, role, &labels, claim),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_pod_template(
    cluster: &ReviewCluster,
    role: Role,
    labels: &BTreeMap<String, String>,
    claim: &str,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![build_container(cluster, role)],
            volumes: Some(vec![repository_volume(claim)]),
            ..Default::default()
        }),
    }
}

fn repository_volume(claim: &str) -> Volume {
    Volume {
        name: "git-repositories".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn repository_mount() -> VolumeMount {
    VolumeMount {
        name: "git-repositories".to_string(),
        mount_path: REPOSITORY_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

fn build_container(cluster: &ReviewCluster, role: Role) -> Container {
    let resources = role.resources(cluster).map(|r| {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity(r.cpu.clone()));
        requests.insert("memory".to_string(), Quantity(r.memory.clone()));
        K8sResources {
            requests: Some(requests),
            ..Default::default()
        }
    });

    let mut args = vec!["serve".to_string()];
    if role == Role::Replica {
        args.push("--replica".to_string());
    }

    Container {
        name: "review-server".to_string(),
        image: Some(cluster.spec.image.clone()),
        args: Some(args),
        ports: Some(vec![
            ContainerPort {
                name: Some("http".to_string()),
                container_port: HTTP_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("ssh".to_string()),
                container_port: SSH_PORT,
                ..Default::default()
            },
        ]),
        resources,
        volume_mounts: Some(vec![repository_mount()]),
        ..Default::default()
    }
}

// ============================================================================
// Service
// ============================================================================

/// Service in front of one role's StatefulSet
pub struct ServerService(pub Role);

impl DependentResource<ReviewCluster> for ServerService {
    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<Service>(&())
    }

    fn desired(&self, cluster: &ReviewCluster, siblings: &Siblings) -> Result<DesiredResource> {
        // Select exactly the pods the applied StatefulSet manages.
        let selector = siblings
            .get_as::<StatefulSet>(self.0.workload_node())
            .and_then(|sts| sts.spec)
            .and_then(|spec| spec.selector.match_labels)
            .unwrap_or_else(|| standard_labels(cluster, self.0.component()));
        DesiredResource::from_typed(&build_service(cluster, self.0, selector))
    }
}

fn build_service(cluster: &ReviewCluster, role: Role, selector: BTreeMap<String, String>) -> Service {
    Service {
        metadata: metadata(
            cluster,
            resource_name(cluster, role.component()),
            role.component(),
        ),
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![
                ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::Int(HTTP_PORT)),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("ssh".to_string()),
                    port: SSH_PORT,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Ingress
// ============================================================================

/// External HTTP access to the primary
pub struct ReviewIngress;

impl DependentResource<ReviewCluster> for ReviewIngress {
    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<Ingress>(&())
    }

    fn precondition(&self, cluster: &ReviewCluster) -> Result<bool> {
        Ok(cluster.spec.ingress.enabled)
    }

    fn desired(&self, cluster: &ReviewCluster, siblings: &Siblings) -> Result<DesiredResource> {
        if cluster.spec.ingress.host.trim().is_empty() {
            return Err(builder_error(nodes::INGRESS, "ingress host is empty"));
        }
        let service = siblings
            .get(nodes::PRIMARY_SERVICE)
            .map(|svc| svc.name_any())
            .unwrap_or_else(|| resource_name(cluster, Role::Primary.component()));
        DesiredResource::from_typed(&build_ingress(cluster, &service))
    }
}

fn build_ingress(cluster: &ReviewCluster, service: &str) -> Ingress {
    let config = &cluster.spec.ingress;

    let rule = IngressRule {
        host: Some(config.host.clone()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service.to_string(),
                        port: Some(ServiceBackendPort {
                            name: Some("http".to_string()),
                            number: None,
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    };

    let tls = config.tls_secret.as_ref().map(|secret| {
        vec![IngressTLS {
            hosts: Some(vec![config.host.clone()]),
            secret_name: Some(secret.clone()),
        }]
    });

    Ingress {
        metadata: metadata(cluster, resource_name(cluster, nodes::INGRESS), "network"),
        spec: Some(IngressSpec {
            ingress_class_name: config.class_name.clone(),
            rules: Some(vec![rule]),
            tls,
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// CronJob
// ============================================================================

/// Scheduled git garbage collection over the shared repositories
pub struct GitGcCronJob;

impl DependentResource<ReviewCluster> for GitGcCronJob {
    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<CronJob>(&())
    }

    fn precondition(&self, cluster: &ReviewCluster) -> Result<bool> {
        Ok(cluster.spec.maintenance.git_gc_schedule.is_some())
    }

    fn desired(&self, cluster: &ReviewCluster, siblings: &Siblings) -> Result<DesiredResource> {
        let schedule = cluster
            .spec
            .maintenance
            .git_gc_schedule
            .clone()
            .ok_or_else(|| builder_error(nodes::GIT_GC, "no schedule configured"))?;
        let cronjob = build_git_gc_cronjob(cluster, schedule, &repository_claim(cluster, siblings));
        DesiredResource::from_typed(&cronjob)
    }
}

fn build_git_gc_cronjob(cluster: &ReviewCluster, schedule: String, claim: &str) -> CronJob {
    let labels = standard_labels(cluster, "maintenance");

    CronJob {
        metadata: metadata(cluster, resource_name(cluster, nodes::GIT_GC), "maintenance"),
        spec: Some(CronJobSpec {
            schedule,
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            restart_policy: Some("OnFailure".to_string()),
                            containers: vec![Container {
                                name: "git-gc".to_string(),
                                image: Some(cluster.spec.image.clone()),
                                args: Some(vec![
                                    "gc".to_string(),
                                    REPOSITORY_MOUNT_PATH.to_string(),
                                ]),
                                volume_mounts: Some(vec![repository_mount()]),
                                ..Default::default()
                            }],
                            volumes: Some(vec![repository_volume(claim)]),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Workflow
// ============================================================================

/// The dependency graph reconciled for every ReviewCluster
pub fn review_cluster_workflow() -> Result<Workflow<ReviewCluster>> {
    Workflow::builder("reviewcluster")
        .add(DependentNode::new(nodes::GIT_REPOSITORIES, RepositoryVolume).condition("StorageReady"))
        .add(
            DependentNode::new(nodes::PRIMARY, ServerStatefulSet(Role::Primary))
                .depends_on([nodes::GIT_REPOSITORIES])
                .condition("PrimaryReady"),
        )
        .add(
            DependentNode::new(nodes::PRIMARY_SERVICE, ServerService(Role::Primary))
                .depends_on([nodes::PRIMARY])
                .condition("PrimaryReady"),
        )
        .add(
            DependentNode::new(nodes::REPLICA, ServerStatefulSet(Role::Replica))
                .depends_on([nodes::GIT_REPOSITORIES])
                .optional()
                .condition("ReplicaReady"),
        )
        .add(
            DependentNode::new(nodes::REPLICA_SERVICE, ServerService(Role::Replica))
                .depends_on([nodes::REPLICA])
                .optional()
                .condition("ReplicaReady"),
        )
        .add(
            DependentNode::new(nodes::INGRESS, ReviewIngress)
                .depends_on([nodes::PRIMARY_SERVICE])
                .optional()
                .condition("NetworkReady"),
        )
        .add(
            DependentNode::new(nodes::GIT_GC, GitGcCronJob)
                .depends_on([nodes::GIT_REPOSITORIES])
                .optional()
                .condition("MaintenanceReady"),
        )
        .build()
}
