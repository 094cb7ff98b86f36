//! Workload builders
//!
//! Pure constructors for the Kubernetes objects that run pools and volume
//! targets. The reconcilers decide when to create them.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::context::ImageConfig;
use super::finalizer::controller_owner_ref;
use crate::crd::keys::{
    APP_LABEL, CLUSTER_LABEL, EXPORTER_PORT, GRPC_PORT, HOSTNAME_LABEL, ISCSI_PORT, MGMT_PORT,
    PERSISTENT_VOLUME_LABEL, POOL_APP, POOL_INSTANCE_NAME_LABEL, TARGET_APP, TARGET_LABEL,
    TARGET_SERVICE_LABEL, TARGET_VALUE, VERSION_LABEL,
};
use crate::crd::{
    CStorPoolCluster, CStorPoolInstance, CStorVolume, CStorVolumeClaim, ResourceSettings,
    TargetPolicy, TolerationSettings,
};
use crate::error::Result;

const POOL_CONTAINER: &str = "cstor-pool";
const POOL_MGMT_CONTAINER: &str = "cstor-pool-mgmt";
const TARGET_CONTAINER: &str = "cstor-istgt";
const VOLUME_MGMT_CONTAINER: &str = "cstor-volume-mgmt";

const DEVICE_VOLUME: &str = "device";
const UDEV_VOLUME: &str = "udev";
const SOCKET_VOLUME: &str = "sockfile";
const CONFIG_VOLUME: &str = "conf";

/// Host directory for pool state.
const POOL_STATE_DIR: &str = "/var/openebs/cstor-pool";

/// Name of the target workload of a volume.
pub fn target_deployment_name(volume: &str) -> String {
    format!("{}-target", volume)
}

// =============================================================================
// Pool workload
// =============================================================================

/// Labels carried by a pool workload and its pods.
pub fn pool_labels(cluster: &str, instance: &str) -> BTreeMap<String, String> {
    [
        (APP_LABEL.to_string(), POOL_APP.to_string()),
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
        (POOL_INSTANCE_NAME_LABEL.to_string(), instance.to_string()),
    ]
    .into()
}

/// The pool-management workload for one pool instance.
///
/// Named after the instance, pinned to the instance's host and owned by it.
pub fn pool_deployment(
    cluster: &CStorPoolCluster,
    instance: &CStorPoolInstance,
    images: &ImageConfig,
    version: &str,
) -> Result<appsv1::Deployment> {
    let name = instance.name_any();
    let selector = pool_labels(&cluster.name_any(), &name);
    let mut labels = selector.clone();
    labels.insert(VERSION_LABEL.to_string(), version.to_string());

    let config = &instance.spec.pool_config;
    let resources = config
        .resources
        .as_ref()
        .or(cluster.spec.default_resources.as_ref());
    let aux_resources = config
        .aux_resources
        .as_ref()
        .or(cluster.spec.default_aux_resources.as_ref());
    let priority_class_name = config
        .priority_class_name
        .clone()
        .or_else(|| cluster.spec.default_priority_class_name.clone());

    let identity_env = vec![
        env("OPENEBS_IO_CSPI_ID", instance.uid().unwrap_or_default()),
        env("OPENEBS_IO_POOL_NAME", name.clone()),
        env_from_field("NAMESPACE", "metadata.namespace"),
    ];

    let pool = corev1::Container {
        name: POOL_CONTAINER.to_string(),
        image: Some(images.pool.clone()),
        env: Some(identity_env.clone()),
        resources: resources.map(requirements),
        security_context: Some(privileged()),
        volume_mounts: Some(vec![
            mount(DEVICE_VOLUME, "/dev"),
            mount(UDEV_VOLUME, "/run/udev"),
            mount(SOCKET_VOLUME, "/var/tmp/sock"),
            mount(CONFIG_VOLUME, "/var/openebs/cstor-pool/conf"),
        ]),
        ..Default::default()
    };

    let mut mgmt_env = identity_env;
    mgmt_env.push(env("RESYNC_INTERVAL", "30".to_string()));
    if let Some(limit) = config.ro_threshold_limit {
        mgmt_env.push(env("OPENEBS_IO_RO_THRESHOLD", limit.to_string()));
    }
    let mgmt = corev1::Container {
        name: POOL_MGMT_CONTAINER.to_string(),
        image: Some(images.pool_mgmt.clone()),
        env: Some(mgmt_env),
        resources: aux_resources.map(requirements),
        security_context: Some(privileged()),
        volume_mounts: Some(vec![
            mount(DEVICE_VOLUME, "/dev"),
            mount(SOCKET_VOLUME, "/var/tmp/sock"),
            mount(CONFIG_VOLUME, "/var/openebs/cstor-pool/conf"),
        ]),
        ..Default::default()
    };

    Ok(appsv1::Deployment {
        metadata: metav1::ObjectMeta {
            name: Some(name.clone()),
            namespace: instance.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![controller_owner_ref(instance)?]),
            ..Default::default()
        },
        spec: Some(appsv1::DeploymentSpec {
            replicas: Some(1),
            selector: metav1::LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            strategy: Some(appsv1::DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(corev1::PodSpec {
                    node_selector: Some(
                        [(HOSTNAME_LABEL.to_string(), instance.host().to_string())].into(),
                    ),
                    priority_class_name,
                    containers: vec![pool, mgmt],
                    volumes: Some(vec![
                        host_path(DEVICE_VOLUME, "/dev", "Directory"),
                        host_path(UDEV_VOLUME, "/run/udev", "Directory"),
                        host_path(
                            SOCKET_VOLUME,
                            &format!("{}/{}/sock", POOL_STATE_DIR, name),
                            "DirectoryOrCreate",
                        ),
                        host_path(
                            CONFIG_VOLUME,
                            &format!("{}/{}", POOL_STATE_DIR, name),
                            "DirectoryOrCreate",
                        ),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

// =============================================================================
// Volume target
// =============================================================================

fn target_selector(volume: &str) -> BTreeMap<String, String> {
    [
        (APP_LABEL.to_string(), TARGET_APP.to_string()),
        (PERSISTENT_VOLUME_LABEL.to_string(), volume.to_string()),
        (TARGET_LABEL.to_string(), TARGET_VALUE.to_string()),
    ]
    .into()
}

fn service_port(name: &str, port: i32) -> corev1::ServicePort {
    corev1::ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// The iSCSI target service of a volume, named after and owned by the claim.
pub fn target_service(claim: &CStorVolumeClaim) -> Result<corev1::Service> {
    let name = claim.name_any();
    let mut labels: BTreeMap<String, String> = [
        (APP_LABEL.to_string(), TARGET_APP.to_string()),
        (PERSISTENT_VOLUME_LABEL.to_string(), name.clone()),
        (TARGET_SERVICE_LABEL.to_string(), TARGET_VALUE.to_string()),
    ]
    .into();
    if let Some(cluster) = claim.cluster_name() {
        labels.insert(CLUSTER_LABEL.to_string(), cluster.to_string());
    }

    Ok(corev1::Service {
        metadata: metav1::ObjectMeta {
            name: Some(name.clone()),
            namespace: claim.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![controller_owner_ref(claim)?]),
            ..Default::default()
        },
        spec: Some(corev1::ServiceSpec {
            selector: Some(target_selector(&name)),
            ports: Some(vec![
                service_port("cstor-iscsi", ISCSI_PORT),
                service_port("cstor-grpc", GRPC_PORT),
                service_port("mgmt", MGMT_PORT),
                service_port("exporter", EXPORTER_PORT),
            ]),
            ..Default::default()
        }),
        status: None,
    })
}

/// The target workload serving a volume, owned by the volume.
///
/// Resources, tolerations and priority class come from the volume policy.
pub fn target_deployment(
    volume: &CStorVolume,
    images: &ImageConfig,
    policy: &TargetPolicy,
) -> Result<appsv1::Deployment> {
    let volume_name = volume.name_any();
    let selector = target_selector(&volume_name);
    let mut labels = selector.clone();
    if let Some(cluster) = volume.labels().get(CLUSTER_LABEL) {
        labels.insert(CLUSTER_LABEL.to_string(), cluster.clone());
    }

    let volume_env = vec![
        env("OPENEBS_IO_CSTOR_VOLUME_ID", volume.uid().unwrap_or_default()),
        env("OPENEBS_IO_VOLUME_NAME", volume_name.clone()),
        env_from_field("NAMESPACE", "metadata.namespace"),
    ];

    let target = corev1::Container {
        name: TARGET_CONTAINER.to_string(),
        image: Some(images.target.clone()),
        ports: Some(vec![corev1::ContainerPort {
            container_port: ISCSI_PORT,
            ..Default::default()
        }]),
        env: Some(volume_env.clone()),
        resources: policy.resources.as_ref().map(requirements),
        security_context: Some(privileged()),
        volume_mounts: Some(vec![mount(SOCKET_VOLUME, "/var/run")]),
        ..Default::default()
    };
    let mgmt = corev1::Container {
        name: VOLUME_MGMT_CONTAINER.to_string(),
        image: Some(images.volume_mgmt.clone()),
        env: Some(volume_env),
        resources: policy.aux_resources.as_ref().map(requirements),
        volume_mounts: Some(vec![mount(SOCKET_VOLUME, "/var/run")]),
        ..Default::default()
    };
    let tolerations: Vec<corev1::Toleration> = policy.tolerations.iter().map(toleration).collect();

    Ok(appsv1::Deployment {
        metadata: metav1::ObjectMeta {
            name: Some(target_deployment_name(&volume_name)),
            namespace: volume.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![controller_owner_ref(volume)?]),
            ..Default::default()
        },
        spec: Some(appsv1::DeploymentSpec {
            replicas: Some(1),
            selector: metav1::LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            strategy: Some(appsv1::DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(corev1::PodSpec {
                    containers: vec![target, mgmt],
                    priority_class_name: policy.priority_class_name.clone(),
                    tolerations: Some(tolerations).filter(|t| !t.is_empty()),
                    volumes: Some(vec![corev1::Volume {
                        name: SOCKET_VOLUME.to_string(),
                        empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn requirements(settings: &ResourceSettings) -> corev1::ResourceRequirements {
    let quantities = |m: &BTreeMap<String, String>| {
        Some(m)
            .filter(|m| !m.is_empty())
            .map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                    .collect::<BTreeMap<_, _>>()
            })
    };
    corev1::ResourceRequirements {
        requests: quantities(&settings.requests),
        limits: quantities(&settings.limits),
        ..Default::default()
    }
}

fn toleration(settings: &TolerationSettings) -> corev1::Toleration {
    corev1::Toleration {
        key: settings.key.clone(),
        operator: settings.operator.clone(),
        value: settings.value.clone(),
        effect: settings.effect.clone(),
        toleration_seconds: settings.toleration_seconds,
    }
}

fn env(name: &str, value: String) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

fn env_from_field(name: &str, path: &str) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.to_string(),
        value_from: Some(corev1::EnvVarSource {
            field_ref: Some(corev1::ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> corev1::VolumeMount {
    corev1::VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn host_path(name: &str, path: &str, type_: &str) -> corev1::Volume {
    corev1::Volume {
        name: name.to_string(),
        host_path: Some(corev1::HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(type_.to_string()),
        }),
        ..Default::default()
    }
}

fn privileged() -> corev1::SecurityContext {
    corev1::SecurityContext {
        privileged: Some(true),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        CStorPoolClusterSpec, CStorPoolInstanceSpec, CStorVolumeClaimSpec, CStorVolumeSpec,
        PoolConfig,
    };

    fn with_identity<K: kube::Resource>(mut obj: K, name: &str) -> K {
        obj.meta_mut().namespace = Some("openebs".into());
        obj.meta_mut().uid = Some(format!("uid-{}", name));
        obj
    }

    fn cluster() -> CStorPoolCluster {
        with_identity(
            CStorPoolCluster::new(
                "cspc-a",
                CStorPoolClusterSpec {
                    default_priority_class_name: Some("cluster-default".into()),
                    default_resources: Some(ResourceSettings {
                        requests: [("memory".to_string(), "2Gi".to_string())].into(),
                        limits: BTreeMap::new(),
                    }),
                    ..Default::default()
                },
            ),
            "cspc-a",
        )
    }

    fn instance(config: PoolConfig) -> CStorPoolInstance {
        with_identity(
            CStorPoolInstance::new(
                "cspc-a-x7k2q",
                CStorPoolInstanceSpec {
                    host_name: "n1".into(),
                    pool_config: config,
                    ..Default::default()
                },
            ),
            "cspc-a-x7k2q",
        )
    }

    #[test]
    fn test_pool_deployment_shape() {
        let d = pool_deployment(&cluster(), &instance(PoolConfig::default()), &ImageConfig::default(), "3.5.0")
            .unwrap();
        assert_eq!(d.name_any(), "cspc-a-x7k2q");
        assert_eq!(d.labels().get(VERSION_LABEL).unwrap(), "3.5.0");
        assert_eq!(d.owner_references()[0].kind, "CStorPoolInstance");

        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.strategy.unwrap().type_.as_deref(), Some("Recreate"));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.node_selector.unwrap().get(HOSTNAME_LABEL).unwrap(), "n1");
        assert_eq!(pod.priority_class_name.as_deref(), Some("cluster-default"));
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec![POOL_CONTAINER, POOL_MGMT_CONTAINER]);
        let requests = pod.containers[0]
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .unwrap();
        assert_eq!(requests.get("memory"), Some(&Quantity("2Gi".into())));
    }

    #[test]
    fn test_pool_settings_override_cluster_defaults() {
        let config = PoolConfig {
            priority_class_name: Some("pool-class".into()),
            resources: Some(ResourceSettings {
                requests: BTreeMap::new(),
                limits: [("cpu".to_string(), "500m".to_string())].into(),
            }),
            ..Default::default()
        };
        let d = pool_deployment(&cluster(), &instance(config), &ImageConfig::default(), "3.5.0").unwrap();
        let pod = d.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.priority_class_name.as_deref(), Some("pool-class"));
        let resources = pod.containers[0].resources.clone().unwrap();
        assert!(resources.requests.is_none());
        assert_eq!(resources.limits.unwrap().get("cpu"), Some(&Quantity("500m".into())));
    }

    #[test]
    fn test_target_service_ports_and_selector() {
        let mut claim = with_identity(
            CStorVolumeClaim::new(
                "pvc-1",
                CStorVolumeClaimSpec {
                    capacity: "5Gi".into(),
                    ..Default::default()
                },
            ),
            "pvc-1",
        );
        claim.labels_mut().insert(CLUSTER_LABEL.into(), "cspc-a".into());

        let svc = target_service(&claim).unwrap();
        assert_eq!(svc.name_any(), "pvc-1");
        assert_eq!(svc.owner_references()[0].kind, "CStorVolumeClaim");
        let spec = svc.spec.unwrap();
        let ports: Vec<(String, i32)> = spec
            .ports
            .unwrap()
            .into_iter()
            .map(|p| (p.name.unwrap(), p.port))
            .collect();
        assert_eq!(
            ports,
            vec![
                ("cstor-iscsi".to_string(), 3260),
                ("cstor-grpc".to_string(), 7777),
                ("mgmt".to_string(), 6060),
                ("exporter".to_string(), 9500),
            ]
        );
        assert_eq!(spec.selector.unwrap(), target_selector("pvc-1"));
    }

    #[test]
    fn test_target_deployment_matches_service() {
        let volume = with_identity(CStorVolume::new("pvc-1", CStorVolumeSpec::default()), "pvc-1");
        let d = target_deployment(&volume, &ImageConfig::default(), &TargetPolicy::default())
            .unwrap();
        assert_eq!(d.name_any(), "pvc-1-target");
        assert_eq!(d.owner_references()[0].kind, "CStorVolume");
        let spec = d.spec.unwrap();
        assert_eq!(spec.selector.match_labels.unwrap(), target_selector("pvc-1"));
        let pod = spec.template.spec.unwrap();
        assert!(pod.tolerations.is_none());
        assert!(pod.containers.iter().all(|c| c.resources.is_none()));
    }

    #[test]
    fn test_target_deployment_follows_policy() {
        let volume = with_identity(CStorVolume::new("pvc-1", CStorVolumeSpec::default()), "pvc-1");
        let policy = TargetPolicy {
            resources: Some(ResourceSettings {
                requests: [("memory".to_string(), "1Gi".to_string())].into(),
                limits: BTreeMap::new(),
            }),
            tolerations: vec![TolerationSettings {
                key: Some("storage".into()),
                operator: Some("Equal".into()),
                value: Some("cstor".into()),
                effect: Some("NoSchedule".into()),
                toleration_seconds: None,
            }],
            priority_class_name: Some("target-class".into()),
            ..Default::default()
        };
        let d = target_deployment(&volume, &ImageConfig::default(), &policy).unwrap();
        let pod = d.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.priority_class_name.as_deref(), Some("target-class"));
        let tolerations = pod.tolerations.unwrap();
        assert_eq!(tolerations.len(), 1);
        assert_eq!(tolerations[0].key.as_deref(), Some("storage"));
        assert_eq!(tolerations[0].effect.as_deref(), Some("NoSchedule"));

        let target = &pod.containers[0];
        assert_eq!(target.name, TARGET_CONTAINER);
        let requests = target.resources.clone().unwrap().requests.unwrap();
        assert_eq!(requests.get("memory"), Some(&Quantity("1Gi".into())));
        assert!(pod.containers[1].resources.is_none());
    }
}
