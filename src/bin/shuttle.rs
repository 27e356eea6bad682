use shuttle_axum::ShuttleAxum;
use shuttle_runtime::SecretStore;
use edgekv::config::{default_config, CompositeConfig, Config, HashMapConfig};
use anyhow::{Result, anyhow};

#[derive(Clone)]
struct ShuttleConfig {
    secret_store: SecretStore
}

impl Config for ShuttleConfig{
    fn get(&self, key: &str) -> Result<String> {
        self.secret_store.get(key).ok_or_else(||anyhow!("config key {key} not found"))
    }
    fn clone_box_dyn(&self) -> Box<dyn Config> {
        Box::new(self.clone())
    }
}

#[shuttle_runtime::main]
async fn axum(
    #[shuttle_shared_db::Postgres] pg_address: String,
    #[shuttle_runtime::Secrets] secret_store: SecretStore
) -> ShuttleAxum {

    // shuttle's proxy sets the forwarding headers, secrets may still turn trust off
    let defaults = CompositeConfig::from_configs(
        Box::new(HashMapConfig::default().with("TRUST_FORWARDED_HEADERS", "true")),
        Box::new(default_config())
    );
    let config = CompositeConfig::from_configs(
        Box::new(ShuttleConfig {secret_store}),
        Box::new(defaults)
    );
    // the provisioned database always wins over a configured one
    let config = CompositeConfig::from_configs(
        Box::new(HashMapConfig::default().with("PG_ADDRESS", &pg_address)),
        Box::new(config)
    );

    let store = edgekv::open_store(&config).await?;
    let router = edgekv::build_router(store, config)?;

    Ok(router.into())
}
