//! Structural checks run before rendering

use std::collections::HashSet;

use k8s_openapi::api::core::v1::PodSpec;

use super::error::TemplateError;
use crate::crd::{KernelConnectionConfig, KernelTransport};

const CONTAINERS: &str = "spec.template.spec.containers";
const CONNECTION: &str = "spec.connectionConfig";

/// Reject pod templates that cannot host a kernel
pub fn validate_template(spec: &PodSpec) -> Result<(), TemplateError> {
    if spec.containers.is_empty() {
        return Err(TemplateError::template(
            CONTAINERS,
            "at least one container is required",
        ));
    }

    let mut seen = HashSet::new();
    for (i, container) in spec.containers.iter().enumerate() {
        if container.name.trim().is_empty() {
            return Err(TemplateError::template(
                format!("{CONTAINERS}[{i}].name"),
                "container name must not be empty",
            ));
        }
        if !seen.insert(container.name.as_str()) {
            return Err(TemplateError::template(
                format!("{CONTAINERS}[{i}].name"),
                format!("duplicate container name '{}'", container.name),
            ));
        }
    }

    let has_image = spec.containers[0]
        .image
        .as_deref()
        .is_some_and(|image| !image.trim().is_empty());
    if !has_image {
        return Err(TemplateError::template(
            format!("{CONTAINERS}[0].image"),
            "kernel container image is required",
        ));
    }

    Ok(())
}

/// Reject connection parameters the kernel could never bind
pub fn validate_connection(cfg: &KernelConnectionConfig) -> Result<(), TemplateError> {
    if cfg.ip.trim().is_empty() {
        return Err(TemplateError::connection(
            format!("{CONNECTION}.ip"),
            "ip must not be empty",
        ));
    }

    if !cfg.signature_scheme.starts_with("hmac-") {
        return Err(TemplateError::connection(
            format!("{CONNECTION}.signatureScheme"),
            format!(
                "unsupported signature scheme '{}', expected hmac-<digest>",
                cfg.signature_scheme
            ),
        ));
    }

    for (name, port) in cfg.named_ports() {
        if !(1..=65535).contains(&port) {
            return Err(TemplateError::connection(
                format!("{CONNECTION}.{}", port_field(name)),
                format!("port {port} is outside 1-65535"),
            ));
        }
    }

    if cfg.transport == KernelTransport::Tcp {
        let mut seen = HashSet::new();
        for (name, port) in cfg.named_ports() {
            if !seen.insert(port) {
                return Err(TemplateError::connection(
                    format!("{CONNECTION}.{}", port_field(name)),
                    format!("port {port} is used by more than one channel"),
                ));
            }
        }
    }

    Ok(())
}

fn port_field(channel: &str) -> String {
    format!("{channel}Port")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Container;

    fn container(name: &str, image: Option<&str>) -> Container {
        Container {
            name: name.to_string(),
            image: image.map(String::from),
            ..Default::default()
        }
    }

    fn connection() -> KernelConnectionConfig {
        KernelConnectionConfig {
            ip: "0.0.0.0".to_string(),
            transport: KernelTransport::Tcp,
            shell_port: 52001,
            iopub_port: 52002,
            stdin_port: 52003,
            control_port: 52004,
            hb_port: 52005,
            signature_scheme: "hmac-sha256".to_string(),
            key: None,
            kernel_name: None,
        }
    }

    #[test]
    fn test_valid_template_passes() {
        let spec = PodSpec {
            containers: vec![
                container("kernel", Some("jupyter/base-notebook")),
                container("sidecar", None),
            ],
            ..Default::default()
        };
        assert!(validate_template(&spec).is_ok());
    }

    #[test]
    fn test_empty_containers_rejected() {
        let err = validate_template(&PodSpec::default()).unwrap_err();
        assert_eq!(err.field(), Some("spec.template.spec.containers"));
    }

    #[test]
    fn test_missing_kernel_image_rejected() {
        let spec = PodSpec {
            containers: vec![container("kernel", Some("  "))],
            ..Default::default()
        };
        let err = validate_template(&spec).unwrap_err();
        assert_eq!(err.field(), Some("spec.template.spec.containers[0].image"));
    }

    #[test]
    fn test_duplicate_container_names_rejected() {
        let spec = PodSpec {
            containers: vec![container("k", Some("img")), container("k", Some("img"))],
            ..Default::default()
        };
        let err = validate_template(&spec).unwrap_err();
        assert_eq!(err.field(), Some("spec.template.spec.containers[1].name"));
        assert!(err.to_string().contains("duplicate container name"));
    }

    #[test]
    fn test_empty_container_name_rejected() {
        let spec = PodSpec {
            containers: vec![container("", Some("img"))],
            ..Default::default()
        };
        assert!(validate_template(&spec).is_err());
    }

    #[test]
    fn test_valid_connection_passes() {
        assert!(validate_connection(&connection()).is_ok());
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let mut cfg = connection();
        cfg.hb_port = 70000;
        let err = validate_connection(&cfg).unwrap_err();
        assert_eq!(err.field(), Some("spec.connectionConfig.hbPort"));

        cfg.hb_port = 0;
        assert!(validate_connection(&cfg).is_err());
    }

    #[test]
    fn test_duplicate_ports_rejected_on_tcp_only() {
        let mut cfg = connection();
        cfg.stdin_port = cfg.shell_port;
        let err = validate_connection(&cfg).unwrap_err();
        assert_eq!(err.field(), Some("spec.connectionConfig.stdinPort"));

        cfg.transport = KernelTransport::Ipc;
        assert!(validate_connection(&cfg).is_ok());
    }

    #[test]
    fn test_empty_ip_rejected() {
        let mut cfg = connection();
        cfg.ip = String::new();
        let err = validate_connection(&cfg).unwrap_err();
        assert_eq!(err.field(), Some("spec.connectionConfig.ip"));
    }

    #[test]
    fn test_non_hmac_signature_scheme_rejected() {
        let mut cfg = connection();
        cfg.signature_scheme = "md5".to_string();
        let err = validate_connection(&cfg).unwrap_err();
        assert_eq!(err.field(), Some("spec.connectionConfig.signatureScheme"));
    }

    #[test]
    fn test_unknown_transport_does_not_deserialize() {
        let json = r#"{"transport":"udp","shellPort":1,"iopubPort":2,"stdinPort":3,"controlPort":4,"hbPort":5}"#;
        assert!(serde_json::from_str::<KernelConnectionConfig>(json).is_err());
    }
}
