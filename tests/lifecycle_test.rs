//! Trial lifecycle integration tests
//!
//! Drives whole experiments through the public API on the memory and local
//! backends: successful and failing trials, history, parameter snapshots,
//! restart from the local snapshot, and the threaded executor.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use trialbook::environment::{Collector, Snapshot};
use trialbook::{Error, Experiment, Node, ResultHandle, ResultNode, StepError, Value};

fn labels(label: &str, value: &str) -> Snapshot {
    Snapshot::Labels(vec![(label.to_string(), value.to_string())])
}

fn environment() -> Vec<(Collector, Snapshot)> {
    vec![
        (Collector::Platform, labels("Operating System", "test-os")),
        (Collector::Rust, labels("Crate Version", "0.0.0")),
        (Collector::Git, labels("Git Repository", "Not Git Controlled")),
        (Collector::Requirements, Snapshot::Text("trialbook==test".to_string())),
    ]
}

fn memory(id: &str) -> Arc<Experiment> {
    Experiment::builder(id)
        .backend("memory://")
        .environment(environment())
        .build()
        .unwrap()
}

fn local(id: &str, root: &TempDir) -> Arc<Experiment> {
    Experiment::builder(id)
        .cache_root(root.path())
        .environment(environment())
        .build()
        .unwrap()
}

fn int_arg(args: &[Value]) -> Result<i64, StepError> {
    args.first()
        .and_then(Value::as_i64)
        .ok_or_else(|| StepError::new("TypeError", "expected an integer"))
}

fn inc(exp: &Arc<Experiment>) -> ResultHandle {
    exp.result("inc", |args| Ok(json!(int_arg(args)? + 1)))
}

fn div(exp: &Arc<Experiment>) -> ResultHandle {
    exp.result("div", |args| match int_arg(args)? {
        0 => Err(StepError::new("ZeroDivisionError", "division by zero")),
        a => Ok(json!(3 / a)),
    })
}

fn experiments(root: &TempDir, id: &str) -> Vec<Arc<Experiment>> {
    vec![memory(id), local(id, root)]
}

#[test]
fn test_inc_then_div_history() {
    let root = TempDir::new().unwrap();
    for exp in experiments(&root, "inc_div") {
        let a = exp.parameter("a", None).unwrap();
        let inc_node = inc(&exp).call([&a]);
        let div_node = div(&exp).call([&a]);

        exp.set_parameters([("a", json!(1))]).unwrap();
        assert_eq!(inc_node.compute().unwrap(), json!(2));
        assert_eq!(exp.trial_id().unwrap(), 1);

        exp.set_parameters([("a", json!(3))]).unwrap();
        assert_eq!(inc_node.compute().unwrap(), json!(4));
        assert_eq!(exp.trial_id().unwrap(), 2);

        exp.set_parameters([("a", json!(0))]).unwrap();
        let err = div_node.compute().unwrap_err();
        assert!(matches!(&err, Error::Step(e) if e.kind() == "ZeroDivisionError"));
        assert_eq!(exp.trial_id().unwrap(), 3);

        let history = exp.get_history().unwrap();
        assert_eq!(history.trial_ids(), vec![1, 2, 3]);
        assert_eq!(history.value(1, "a"), Some(json!(1)));
        assert_eq!(history.value(1, "Result"), Some(json!(2)));
        assert_eq!(history.value(2, "a"), Some(json!(3)));
        assert_eq!(history.value(2, "Result"), Some(json!(4)));
        assert_eq!(history.value(2, "Success"), Some(json!(true)));
        assert_eq!(history.value(3, "Success"), Some(json!(false)));
        assert_eq!(history.value(3, "Result"), None);
        let description = history.value(3, "Description").unwrap();
        assert!(description.as_str().unwrap().starts_with("ZeroDivisionError"));
    }
}

#[test]
fn test_parameter_snapshot_is_independent_of_later_sets() {
    let root = TempDir::new().unwrap();
    for exp in experiments(&root, "snapshot") {
        let a = exp.parameter("a", None).unwrap();
        let b = exp.parameter("b", Some(json!("fixed"))).unwrap();
        let node = exp
            .result("pair", |args| Ok(json!([args[0], args[1]])))
            .call([a.node(), b.node()]);

        exp.set_parameters([("a", json!(10))]).unwrap();
        node.compute().unwrap();
        exp.set_parameters([("a", json!(20))]).unwrap();

        let params = exp.get_parameters(Some(1)).unwrap();
        assert_eq!(params.get("a"), Some(&json!(10)));
        assert_eq!(params.get("b"), Some(&json!("fixed")));
        assert!(matches!(exp.get_parameters(Some(2)), Err(Error::TrialNotFound(_))));
    }
}

#[test]
fn test_undeclared_and_undefined_parameters() {
    let exp = memory("undeclared");
    let a = exp.parameter("a", None).unwrap();
    assert!(matches!(
        exp.set_parameters([("nope", json!(1))]),
        Err(Error::ParameterNotDeclared(_))
    ));

    let node = inc(&exp).call([&a]);
    for _ in 0..3 {
        assert!(matches!(node.compute(), Err(Error::ParameterUndefined(_))));
    }
    assert_eq!(exp.trial_id().unwrap(), 0);
}

#[test]
fn test_parameter_named_like_history_column() {
    let exp = memory("column_clash");
    assert!(matches!(exp.parameter("Success", None), Err(Error::InvalidKey { .. })));
    exp.parameter("success", Some(json!(false))).unwrap();

    exp.result("one", |_| Ok(json!(1)))
        .call(Vec::<Node>::new())
        .compute()
        .unwrap();
    let history = exp.get_history().unwrap();
    assert_eq!(history.value(1, "Success"), Some(json!(true)));
    assert_eq!(history.value(1, "success"), Some(json!(false)));
    let batch = history.to_record_batch().unwrap();
    assert_eq!(batch.schema().fields().len(), history.columns().len() + 1);
}

#[test]
fn test_current_trial_id_outside_trial() {
    let exp = memory("outside");
    let err = exp.current_trial_id().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unable to find trial id: Current Trial ID only exists during a trial execution"
    );
}

#[test]
fn test_local_snapshot_survives_restart() {
    let root = TempDir::new().unwrap();
    {
        let exp = local("restart", &root);
        let a = exp.parameter("a", None).unwrap();
        let node = inc(&exp).with_source("|args| a + 1").call([&a]);
        exp.set_parameters([("a", json!(1))]).unwrap();
        node.compute().unwrap();
        exp.set_parameters([("a", json!(2))]).unwrap();
        node.compute().unwrap();
    }

    assert!(root.path().join("restart").join("restart.json").exists());
    assert!(root.path().join("restart").join("code").join("restart_2.rs").exists());

    let exp = local("restart", &root);
    assert_eq!(exp.trial_id().unwrap(), 2);
    assert_eq!(exp.get_history().unwrap().value(2, "Result"), Some(json!(3)));
    assert_eq!(exp.get_code(Some(1)).unwrap(), "|args| a + 1\n");

    let a = exp.parameter("a", Some(json!(5))).unwrap();
    assert_eq!(inc(&exp).call([&a]).compute().unwrap(), json!(6));
    assert_eq!(exp.trial_id().unwrap(), 3);
}

#[test]
fn test_environment_records() {
    let root = TempDir::new().unwrap();
    for exp in experiments(&root, "environment") {
        exp.result("one", |_| Ok(json!(1)))
            .call(Vec::<Node>::new())
            .compute()
            .unwrap();
        assert_eq!(
            exp.get_environment(Some(1)).unwrap(),
            vec![
                "Operating System: test-os".to_string(),
                "Crate Version: 0.0.0".to_string(),
                "Git Repository: Not Git Controlled".to_string(),
            ]
        );
        assert_eq!(exp.get_requirements(None).unwrap(), "trialbook==test");
        assert!(matches!(exp.get_environment(Some(2)), Err(Error::TrialNotFound(_))));
    }
}

#[test]
fn test_purity_warning_does_not_fail_the_trial() {
    let exp = memory("impure");
    let counter = Arc::new(parking_lot::Mutex::new(0_i64));
    let seen = Arc::clone(&counter);
    let node = exp
        .result("impure", move |_| {
            let mut n = seen.lock();
            *n += 1;
            Ok(json!(*n))
        })
        .call([json!("same input")]);

    assert_eq!(node.compute().unwrap(), json!(1));
    assert_eq!(node.compute().unwrap(), json!(2));
    assert_eq!(exp.get_history().unwrap().len(), 2);
}

/// `prepare` doubles `a` and is persisted; `train` logs a finite, a NaN and
/// an infinite loss.
#[allow(clippy::cast_precision_loss)]
fn training(exp: &Arc<Experiment>) -> ResultNode {
    let a = exp.parameter("a", Some(json!(4))).unwrap();
    let prepare = exp.persist("prepare", |args| Ok(json!(int_arg(args)? * 2)));
    let weak = Arc::downgrade(exp);
    let train = exp.result("train", move |args| {
        let exp = weak.upgrade().ok_or_else(|| StepError::new("Gone", "experiment dropped"))?;
        let prepared = int_arg(args)?;
        for (epoch, loss) in [(0, prepared as f64), (1, f64::NAN), (2, f64::INFINITY)] {
            exp.save_metric("loss", epoch, loss)
                .map_err(|e| StepError::new(e.kind(), e.to_string()))?;
        }
        Ok(json!(prepared))
    });
    train.call([prepare.call([&a])])
}

fn assert_training_records(exp: &Experiment) {
    let table = exp.load_metric("loss", &[1]).unwrap();
    assert_eq!(table.epochs(), &[0, 1, 2]);
    assert_eq!(table.get(0, 1), Some(8.0));
    assert!(table.get(1, 1).unwrap().is_nan());
    assert_eq!(table.get(2, 1), Some(f64::INFINITY));
    assert_eq!(exp.metric_keys().unwrap(), vec!["loss".to_string()]);
    assert_eq!(exp.get_persisted("prepare", 1).unwrap(), json!(8));
}

#[test]
fn test_non_finite_metrics_on_every_backend() {
    let root = TempDir::new().unwrap();
    for exp in experiments(&root, "non_finite") {
        assert_eq!(training(&exp).compute().unwrap(), json!(8));
        assert_training_records(&exp);
    }
}

#[test]
fn test_metrics_and_persisted_outputs_survive_restart() {
    let root = TempDir::new().unwrap();
    {
        let exp = local("resume_metrics", &root);
        training(&exp).compute().unwrap();
    }

    let exp = local("resume_metrics", &root);
    assert_eq!(exp.trial_id().unwrap(), 1);
    assert_training_records(&exp);

    training(&exp).compute().unwrap();
    let table = exp.load_metric("loss", &[1, 2]).unwrap();
    assert_eq!(table.trial_ids(), &[1, 2]);
    assert_eq!(table.get(0, 2), Some(8.0));
}

#[cfg(feature = "rayon")]
#[test]
fn test_threaded_executor() {
    use trialbook::graph::Threaded;

    let exp = Experiment::builder("threaded")
        .backend("memory://")
        .environment(environment())
        .executor(Arc::new(Threaded))
        .build()
        .unwrap();
    let a = exp.parameter("a", Some(json!(2))).unwrap();
    let square = exp.step("square", |args| {
        let a = int_arg(args)?;
        Ok(json!(a * a))
    });
    let sum = exp.result("sum", |args| {
        Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
    });
    let branches: Vec<Node> = (0..8).map(|_| square.call([&a])).collect();
    assert_eq!(sum.call(branches).compute().unwrap(), json!(32));
    assert_eq!(exp.trial_id().unwrap(), 1);
}
