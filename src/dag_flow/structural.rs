//! Pure helpers behind LOOP, SWITCH and MERGE nodes.
//!
//! The executor owns scheduling; everything here only builds nodes or
//! combines values.

use serde_json::{Map, Value};
use std::collections::HashSet;

use super::node::{LoopSpec, MergeStrategy, NodeStatus, WorkflowNode};
use super::reference::{as_text, substitute, substitute_str, Reference};
use super::store::ArtifactStore;

/// Id of the child built from `template_id` for iteration `index`.
pub fn loop_child_id(parent_id: &str, index: usize, template_id: &str) -> String {
    format!("{}_iter{}_{}", parent_id, index, template_id)
}

/// Instantiate the loop body for one element.
///
/// The loop variable is substituted into `args` (typed) and `input_mapping`
/// (as text). References and dependencies naming another body template are
/// rewritten to that template's instance for the same iteration; other
/// dependencies are dropped since the loop itself already waited on them.
pub fn instantiate_iteration(
    parent_id: &str,
    spec: &LoopSpec,
    index: usize,
    item: &Value,
) -> Vec<WorkflowNode> {
    let siblings: HashSet<&str> = spec.loop_body.iter().map(|t| t.id.as_str()).collect();
    let var = spec.loop_variable.as_str();

    spec.loop_body
        .iter()
        .map(|template| {
            let mut child = fresh(template);
            child.id = loop_child_id(parent_id, index, &template.id);
            child.depends_on = template
                .depends_on
                .iter()
                .filter(|dep| siblings.contains(dep.as_str()))
                .map(|dep| loop_child_id(parent_id, index, dep))
                .collect();

            if let Value::Object(args) = substitute(&Value::Object(template.args.clone()), var, item)
            {
                child.args = args;
            }

            child.input_mapping = template
                .input_mapping
                .iter()
                .map(|(arg, raw)| {
                    let text = as_text(&substitute_str(raw, var, item));
                    let text = match Reference::parse(&text) {
                        Ok(mut reference) if siblings.contains(reference.step_id.as_str()) => {
                            reference.step_id =
                                loop_child_id(parent_id, index, &reference.step_id);
                            reference.to_string()
                        }
                        _ => text,
                    };
                    (arg.clone(), text)
                })
                .collect();
            child
        })
        .collect()
}

/// Branch templates as live nodes that wait on the switch.
pub fn instantiate_branch(switch_id: &str, branch: &[WorkflowNode]) -> Vec<WorkflowNode> {
    branch
        .iter()
        .map(|template| fresh(template).with_deps([switch_id]))
        .collect()
}

fn fresh(template: &WorkflowNode) -> WorkflowNode {
    let mut node = template.clone();
    node.status = NodeStatus::Pending;
    node.result = None;
    node
}

/// Fallback merge source when a producer has no recorded output: its single
/// artifact, or an object of all of them.
pub fn stored_output(store: &ArtifactStore, producer: &str) -> Value {
    let mut artifacts = store.list(producer);
    match artifacts.len() {
        0 => Value::Null,
        1 => artifacts
            .pop_first()
            .map(|(_, value)| value)
            .unwrap_or(Value::Null),
        _ => Value::Object(artifacts.into_iter().collect()),
    }
}

/// Combine `(node_id, value)` pairs, already in `merge_inputs` order.
pub fn merge_values(strategy: MergeStrategy, inputs: &[(String, Value)]) -> Value {
    match strategy {
        MergeStrategy::Concat => {
            let values: Vec<&Value> = inputs.iter().map(|(_, v)| v).filter(|v| !v.is_null()).collect();
            if !values.is_empty() && values.iter().all(|v| v.is_string()) {
                let joined: Vec<&str> = values.iter().filter_map(|v| v.as_str()).collect();
                return Value::String(joined.join("\n"));
            }
            let mut flattened = Vec::new();
            for value in values {
                match value {
                    Value::Array(items) => flattened.extend(items.iter().cloned()),
                    other => flattened.push(other.clone()),
                }
            }
            Value::Array(flattened)
        }
        MergeStrategy::Dict => {
            let map: Map<String, Value> = inputs.iter().cloned().collect();
            Value::Object(map)
        }
        MergeStrategy::First => inputs
            .iter()
            .map(|(_, v)| v)
            .find(|v| !is_empty_value(v))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn pairs(values: Vec<Value>) -> Vec<(String, Value)> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("n{}", i), v))
            .collect()
    }

    #[test]
    fn test_concat() {
        assert_eq!(
            merge_values(MergeStrategy::Concat, &pairs(vec![json!("a"), json!(null), json!("b")])),
            json!("a\nb")
        );
        assert_eq!(
            merge_values(MergeStrategy::Concat, &pairs(vec![json!([1, 2]), json!(3), json!([4])])),
            json!([1, 2, 3, 4])
        );
        assert_eq!(merge_values(MergeStrategy::Concat, &[]), json!([]));
    }

    #[test]
    fn test_dict_and_first() {
        let inputs = pairs(vec![json!(""), json!([]), json!({"k": 1}), json!(2)]);
        assert_eq!(merge_values(MergeStrategy::First, &inputs), json!({"k": 1}));
        assert_eq!(
            merge_values(MergeStrategy::Dict, &inputs),
            json!({"n0": "", "n1": [], "n2": {"k": 1}, "n3": 2})
        );
        assert_eq!(merge_values(MergeStrategy::First, &pairs(vec![json!(null)])), json!(null));
    }

    #[test]
    fn test_instantiate_iteration() {
        let spec = LoopSpec {
            loop_over: "list.items".into(),
            loop_variable: "row".into(),
            loop_body: vec![
                WorkflowNode::tool("fetch", "http_get")
                    .with_arg("url", json!("{{row.url}}"))
                    .with_arg("meta", json!("{{row}}"))
                    .with_deps(["outside"]),
                WorkflowNode::llm("sum", "summarizer")
                    .with_deps(["fetch"])
                    .with_mapping("text", "fetch.body")
                    .with_mapping("title", "list.titles[{{row.pos}}]"),
            ],
            max_parallel: 2,
        };
        let item = json!({"url": "https://a", "pos": 1});
        let children = instantiate_iteration("each", &spec, 3, &item);

        assert_eq!(children[0].id, "each_iter3_fetch");
        assert_eq!(children[0].args["url"], json!("https://a"));
        assert_eq!(children[0].args["meta"], item);
        assert!(children[0].depends_on.is_empty());

        assert_eq!(children[1].depends_on, vec!["each_iter3_fetch".to_string()]);
        assert_eq!(children[1].input_mapping["text"], "each_iter3_fetch.body");
        assert_eq!(children[1].input_mapping["title"], "list.titles[1]");
    }

    #[test]
    fn test_branch_and_stored_output() {
        let branch = vec![WorkflowNode::tool("alert", "notify").with_deps(["x"])];
        let nodes = instantiate_branch("check", &branch);
        assert_eq!(nodes[0].depends_on, vec!["x".to_string(), "check".to_string()]);

        let store = ArtifactStore::new();
        assert_eq!(stored_output(&store, "p"), json!(null));
        store.store("p", "a", json!(1));
        assert_eq!(stored_output(&store, "p"), json!(1));
        store.store("p", "b", json!(2));
        assert_eq!(stored_output(&store, "p"), json!({"a": 1, "b": 2}));
    }
}
