//! One-time preparation of a proxy deployment.

use tracing::info;

use crate::acme::CertificateIssuer;
use crate::error::Result;
use crate::model::{validate_domain, ServerRegistryEntry, Settings};
use crate::store::Store;

/// Create the tables, the settings row and the proxy's own certificate.
///
/// Running it again leaves existing settings and servers untouched.
pub async fn prepare_proxy(
    store: &Store,
    proxy_domain: &str,
    destination_domain: &str,
    email: &str,
    issuer: &dyn CertificateIssuer,
) -> Result<Settings> {
    validate_domain(proxy_domain)?;
    validate_domain(destination_domain)?;
    store.init().await?;

    let settings = match store.select_settings().await? {
        Some(existing) => {
            info!(proxy_domain = %existing.proxy_domain, "Settings already exist");
            existing
        }
        None => {
            let created = store
                .insert_settings(proxy_domain, destination_domain, email)
                .await?;
            info!(proxy_domain = %proxy_domain, destination = %destination_domain, "Created settings");
            created
        }
    };

    if store.select_servers().await?.is_empty() {
        let issued = issuer.issue(&settings.proxy_domain, &settings.email).await?;
        let entry = ServerRegistryEntry::new(
            settings.proxy_domain.clone(),
            issued.private_key,
            issued.certificate,
        );
        store.insert_server(&entry).await?;
        info!(domain = %entry.domain, "Registered proxy domain");
    } else {
        info!("Servers already registered, skipping certificate issuance");
    }

    Ok(settings)
}
