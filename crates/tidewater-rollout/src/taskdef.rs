//! Spec validation and task-definition construction.

use tidewater_core::ProvisioningConfig;
use tidewater_platform::{ContainerDefinition, EnvironmentVariable, TaskDefinition};
use tidewater_state::{ContainerSpec, DeploymentSpec};

use crate::error::{DeployError, DeployResult};

/// Reject specs the platform would refuse, before anything is mutated.
pub fn validate_spec(service: &str, spec: &DeploymentSpec) -> DeployResult<()> {
    if service.trim().is_empty() {
        return Err(DeployError::InvalidSpec("service name is empty".to_string()));
    }
    if spec.cluster.trim().is_empty() {
        return Err(DeployError::InvalidSpec(format!("{service}: cluster is empty")));
    }
    if spec.containers.is_empty() {
        return Err(DeployError::InvalidSpec(format!("{service}: no containers defined")));
    }
    if let Some(c) = spec
        .containers
        .iter()
        .find(|c| c.memory == 0 && c.memory_reservation == 0)
    {
        return Err(DeployError::InvalidSpec(format!(
            "{service}: container {} sets neither memory nor memoryReservation",
            c.container_name
        )));
    }
    Ok(())
}

/// Resolve the image reference of a container.
///
/// An explicit URI wins. Otherwise `{registry}/{image or name}[:tag]`, with
/// the registry omitted when none is configured.
pub fn image_uri(container: &ContainerSpec, registry: Option<&str>) -> String {
    if let Some(uri) = container.container_uri.as_deref().filter(|u| !u.is_empty()) {
        return uri.to_string();
    }
    let image = container
        .container_image
        .as_deref()
        .filter(|i| !i.is_empty())
        .unwrap_or(&container.container_name);
    let mut uri = match registry {
        Some(r) => format!("{}/{image}", r.trim_end_matches('/')),
        None => image.to_string(),
    };
    if let Some(tag) = container.container_tag.as_deref().filter(|t| !t.is_empty()) {
        uri.push(':');
        uri.push_str(tag);
    }
    uri
}

/// Path containers read their parameters from.
pub fn parameter_path(prefix: &str, service: &str) -> String {
    if prefix.is_empty() {
        format!("/{service}/")
    } else {
        format!("/{prefix}/{service}/")
    }
}

pub fn build_task_definition(
    service: &str,
    task_role: &str,
    spec: &DeploymentSpec,
    provisioning: &ProvisioningConfig,
) -> TaskDefinition {
    let registry = provisioning.image_registry.as_deref();
    let containers = spec
        .containers
        .iter()
        .map(|c| {
            let mut environment = Vec::new();
            if provisioning.parameter_store_enabled {
                environment.push(EnvironmentVariable {
                    name: "AWS_ENV_PATH".to_string(),
                    value: parameter_path(&provisioning.parameter_store_prefix, service),
                });
            }
            ContainerDefinition {
                name: c.container_name.clone(),
                image: image_uri(c, registry),
                port_mappings: c.container_port.into_iter().filter(|p| *p > 0).collect(),
                command: c.container_command.clone(),
                essential: c.essential,
                cpu: (c.cpu > 0).then_some(c.cpu),
                memory: (c.memory > 0).then_some(c.memory),
                memory_reservation: (c.memory_reservation > 0).then_some(c.memory_reservation),
                environment,
            }
        })
        .collect();

    TaskDefinition {
        family: service.to_string(),
        task_role: task_role.to_string(),
        containers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str) -> ContainerSpec {
        ContainerSpec {
            container_name: name.to_string(),
            memory_reservation: 256,
            essential: true,
            ..Default::default()
        }
    }

    fn spec(containers: Vec<ContainerSpec>) -> DeploymentSpec {
        DeploymentSpec {
            cluster: "prod".to_string(),
            containers,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_missing_memory() {
        let mut c = container("api");
        c.memory_reservation = 0;
        let err = validate_spec("api", &spec(vec![container("sidecar"), c])).unwrap_err();
        assert!(matches!(err, DeployError::InvalidSpec(ref m) if m.contains("container api")));
    }

    #[test]
    fn rejects_empty_container_list_and_cluster() {
        assert!(validate_spec("api", &spec(vec![])).is_err());
        let mut s = spec(vec![container("api")]);
        s.cluster.clear();
        assert!(validate_spec("api", &s).is_err());
        assert!(validate_spec("", &spec(vec![container("api")])).is_err());
    }

    #[test]
    fn hard_limit_alone_is_enough() {
        let mut c = container("api");
        c.memory_reservation = 0;
        c.memory = 512;
        assert!(validate_spec("api", &spec(vec![c])).is_ok());
    }

    #[test]
    fn image_uri_resolution() {
        let mut c = container("api");
        assert_eq!(image_uri(&c, None), "api");
        c.container_tag = Some("v3".to_string());
        assert_eq!(
            image_uri(&c, Some("123456789012.dkr.ecr.eu-west-1.amazonaws.com/")),
            "123456789012.dkr.ecr.eu-west-1.amazonaws.com/api:v3"
        );
        c.container_image = Some("team/api-server".to_string());
        assert_eq!(image_uri(&c, Some("registry.local")), "registry.local/team/api-server:v3");
        c.container_uri = Some("docker.io/library/nginx:1.27".to_string());
        assert_eq!(image_uri(&c, Some("registry.local")), "docker.io/library/nginx:1.27");
    }

    #[test]
    fn task_definition_carries_parameter_path() {
        let mut c = container("api");
        c.container_port = Some(8080);
        c.container_command = vec!["serve".to_string()];
        let provisioning = ProvisioningConfig {
            parameter_store_enabled: true,
            parameter_store_prefix: "myco-prod".to_string(),
            ..Default::default()
        };
        let td = build_task_definition("api", "role-arn", &spec(vec![c]), &provisioning);

        assert_eq!(td.family, "api");
        let def = &td.containers[0];
        assert_eq!(def.port_mappings, vec![8080]);
        assert_eq!(def.memory, None);
        assert_eq!(def.memory_reservation, Some(256));
        assert_eq!(def.environment[0].value, "/myco-prod/api/");
    }
}
