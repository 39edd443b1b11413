#![allow(dead_code)]

use std::sync::Arc;

use signalhub_core::{ModelType, SourceId};
use signalhub_infra::{AppConfig, Services};

pub const CUSTOMERS: u64 = 20;

fn config_toml() -> String {
    let records: Vec<String> = (1..=CUSTOMERS)
        .map(|i| {
            let churns = i % 2 == 0;
            format!(
                r#"{{ customerID = "C{i:03}", tenure = {}, monthly_charges = {}, contract = "{}", churn = {churns} }}"#,
                if churns { 1 + i % 4 } else { 40 + i % 20 },
                if churns { "90.0" } else { "35.0" },
                if churns { "Month-to-month" } else { "Two year" },
            )
        })
        .collect();

    format!(
        r#"
[promotion]
metric_floor = 0.0

[sources.telco]
poll_interval = "1h"

[sources.telco.connector]
kind = "inline"
records = [{records}]

[sources.telco.mapping]
entity_type = "customer"
key_fields = ["customerID"]

[[sources.telco.mapping.fields]]
source = "tenure"
type = "int"
required = true

[[sources.telco.mapping.fields]]
source = "monthly_charges"
type = "float"

[[sources.telco.mapping.fields]]
source = "contract"
type = "text"

[[sources.telco.mapping.fields]]
source = "churn"
type = "bool"
"#,
        records = records.join(", ")
    )
}

pub fn source() -> SourceId {
    SourceId::new("telco").unwrap()
}

/// Services with one ingested source and a promoted, scored churn model.
pub fn scored_services() -> Arc<Services> {
    let config = AppConfig::from_toml_str(&config_toml()).unwrap();
    let services = Services::in_memory(config);
    services.pipeline.ingest(&source()).unwrap();
    services.scheduler.train(ModelType::Churn).unwrap();
    Arc::new(services)
}
