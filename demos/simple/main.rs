use std::sync::Arc;

use growthbook::{
    ContextConfig, Error, Experiment, ExperimentResult, FeatureRefreshCallback, GrowthBook,
    RefreshStrategy, RepositoryConfig,
};

/// Keeps a client up to date with pushed changes.
struct ClientUpdater(Arc<GrowthBook>);

impl FeatureRefreshCallback for ClientUpdater {
    fn on_saved_groups_refresh(&self, saved_groups_json: &str) {
        if let Err(err) = self.0.set_saved_groups(saved_groups_json) {
            println!("error applying saved groups: {:?}", err);
        }
    }

    fn on_refresh(&self, features_json: &str) {
        if let Err(err) = self.0.set_features(features_json) {
            println!("error applying features: {:?}", err);
        }
    }

    fn on_error(&self, error: &Error) {
        println!("error refreshing features: {:?}", error);
    }
}

pub fn main() -> growthbook::Result<()> {
    // Configure env_logger to see GrowthBook SDK logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("growthbook")).init();

    let client_key = std::env::var("GROWTHBOOK_CLIENT_KEY")
        .expect("GROWTHBOOK_CLIENT_KEY env variable should contain a client key");
    let mut config = RepositoryConfig::from_client_key(client_key)
        .refresh_strategy(RefreshStrategy::ServerSentEvents);
    if let Ok(api_host) = std::env::var("GROWTHBOOK_API_HOST") {
        config = config.api_host(api_host);
    }
    if let Ok(decryption_key) = std::env::var("GROWTHBOOK_DECRYPTION_KEY") {
        config = config.decryption_key(decryption_key);
    }
    let repository = config.to_repository()?;

    // Block waiting for the first fetch.
    if let Err(err) = repository.initialize() {
        println!("error requesting features: {:?}", err);
    }

    let client = Arc::new(
        ContextConfig::new()
            .features_json(repository.get_features_json())
            .saved_groups_json(repository.get_saved_groups_json())
            .attributes_json(r#"{"id": "test-subject", "country": "US"}"#)
            .tracking_callback(|experiment: &Experiment, result: &ExperimentResult| {
                println!(
                    "Logging exposure: {} -> {}",
                    experiment.key, result.key
                );
            })
            .to_client()?,
    );

    repository.on_features_refresh(ClientUpdater(Arc::clone(&client)));

    let value = client.get_boolean_value("a-boolean-feature", false);
    println!("Value: {:?}", value);

    repository.shutdown()
}
