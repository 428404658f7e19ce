#![forbid(unsafe_code)]

use kubecat_core::RegistrationConfig;
use kubecat_expr::{EvaluatedResult, Evaluator, ExprError, FieldParser, JqEvaluator, RegistrationBuilder};

fn jq() -> Option<JqEvaluator> {
    match JqEvaluator::locate("jq") {
        Ok(j) => Some(j),
        Err(_) => {
            eprintln!("jq not on PATH; skipping");
            None
        }
    }
}

fn deployment() -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": "web",
            "namespace": "self-hosted",
            "annotations": { "opslevel.com/owner": "velero" },
            "labels": { "app": "web", "tier": "frontend" }
        },
        "spec": { "replicas": 3 }
    })
}

#[test]
fn jq_end_to_end_registration() {
    let Some(eval) = jq() else { return };
    let cfg = RegistrationConfig {
        name: ".metadata.name".into(),
        owner: ".metadata.annotations.\"opslevel.com/owner\"".into(),
        description: ".metadata.annotations.\"opslevel.com/description\"".into(),
        aliases: vec!["\"k8s:\\(.metadata.name)-\\(.metadata.namespace)\"".into()],
        ..Default::default()
    };
    let builder = RegistrationBuilder::new(&eval, &cfg).unwrap();
    let reg = builder.build(&deployment()).unwrap();
    assert_eq!(reg.name, "web");
    assert_eq!(reg.owner.as_deref(), Some("velero"));
    assert_eq!(reg.aliases, vec!["k8s:web-self-hosted".to_string()]);
    assert!(reg.description.is_none(), "absent annotation maps to no description");
}

#[test]
fn jq_shapes() {
    let Some(eval) = jq() else { return };
    let obj = deployment();
    let labels = FieldParser::new(&eval, ".metadata.labels").unwrap();
    assert!(matches!(labels.evaluate(&obj).unwrap(), EvaluatedResult::Map(m) if m.len() == 2));
    let list = FieldParser::new(&eval, "[.metadata.labels | to_entries[] | {(.key): .value}]").unwrap();
    assert!(matches!(list.evaluate(&obj).unwrap(), EvaluatedResult::ListOfMaps(v) if v.len() == 2));
    let keys = FieldParser::new(&eval, ".metadata.labels | keys").unwrap();
    assert!(matches!(keys.evaluate(&obj).unwrap(), EvaluatedResult::List(v) if v.len() == 2));
}

#[test]
fn jq_classifies_bad_filters() {
    let Some(eval) = jq() else { return };
    assert!(matches!(eval.compile(".metadata.[["), Err(ExprError::BadFilter { .. })));
    let p = FieldParser::new(&eval, ".metadata.name[]").unwrap();
    assert!(matches!(p.run(&deployment()), Err(ExprError::BadExecution { .. })));
}
