use crate::error::RenewalError;
use crate::storage::Connection;

pub mod vos;

pub use vos::VosDevice;

/// Certificate-management surface of a target appliance. Implemented for VOS
/// devices; test harnesses substitute their own.
pub trait DeviceApi: Send {
    /// Asks the device to generate a CSR for its tomcat service.
    fn generate_csr(&self, common_name: &str, alt_names: &[String])
    -> Result<String, RenewalError>;

    /// Installs the leaf certificate on the device.
    fn upload_identity_certificate(&self, leaf_pem: &str) -> Result<(), RenewalError>;

    /// Trust certificates currently on the device. Failures mean "no trusts
    /// known" and must not fail the renewal.
    fn list_trust_certificates(&self) -> Vec<String>;

    /// Uploads the chain certificates the device does not already trust.
    fn upload_trust_certificates(&self, chain_pems: &[String]) -> Result<(), RenewalError>;
}

/// Builds the device adapter for a connection. Boxed so the orchestrator can
/// be exercised against a stub device.
pub trait DeviceFactory: Send + Sync {
    fn device_for(&self, connection: &Connection) -> Result<Box<dyn DeviceApi>, RenewalError>;
}

/// Default factory: VOS appliances over their certmgr REST API.
pub struct VosDeviceFactory;

impl DeviceFactory for VosDeviceFactory {
    fn device_for(&self, connection: &Connection) -> Result<Box<dyn DeviceApi>, RenewalError> {
        let username = connection.username.clone().ok_or_else(|| {
            RenewalError::ConfigMissing(format!(
                "connection {} has no device username",
                connection.id
            ))
        })?;
        let password = connection.password.clone().ok_or_else(|| {
            RenewalError::ConfigMissing(format!(
                "connection {} has no device password",
                connection.id
            ))
        })?;
        let host = crate::domain::fqdn(&connection.hostname, &connection.domain)
            .map_err(|err| RenewalError::ConfigMissing(format!("{err:#}")))?;
        let device = VosDevice::new(&host, &username, &password)
            .map_err(|err| RenewalError::ConfigMissing(format!("{err:#}")))?;
        Ok(Box::new(device))
    }
}
