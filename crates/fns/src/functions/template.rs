//! The template vertex: renders the vertex's template with the assembled
//! input as the data model and parses the rendered text as JSON.

use anyhow::{anyhow, Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

use weft_engine::{Input, OutputMap, VertexContext};

use super::{fill_outputs, jq};

fn render(template: &str, model: &Value) -> Result<Value> {
    let mut env = Environment::new();
    // Missing keys render as the empty value instead of failing the vertex.
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    let rendered = env
        .render_str(template, model)
        .with_context(|| "cannot render template")?;
    serde_json::from_str(&rendered)
        .with_context(|| format!("rendered template is not valid JSON: {rendered}"))
}

pub fn run(vertex: &VertexContext, input: &Input) -> Result<OutputMap> {
    let template = vertex
        .function
        .template
        .as_deref()
        .ok_or_else(|| anyhow!("template vertex {} without a template", vertex.name))?;

    let mut rendered = Vec::new();
    match jq::eval_range(&vertex.function, input)? {
        Some(items) => {
            for (index, item) in items.into_iter().enumerate() {
                let mut model = input.to_object();
                let obj = model.as_object_mut().expect("input object");
                obj.insert("VALUE".to_string(), item);
                obj.insert("INDEX".to_string(), Value::from(index));
                rendered.push(render(template, &model)?);
            }
        }
        None => rendered.push(render(template, &input.to_object())?),
    }

    Ok(fill_outputs(vertex, Value::Array(rendered)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_engine::{FunctionKind, FunctionSpec};

    fn vertex(template: &str, range: Option<&str>) -> VertexContext {
        let mut function = FunctionSpec::of_kind(FunctionKind::Template);
        function.template = Some(template.to_string());
        function.range = range.map(str::to_string);
        VertexContext {
            name: "tpl".into(),
            function,
            references: vec!["cr".into()],
            block_dag: None,
            outputs: [("out".to_string(), Default::default())].into(),
            gvk_to_var: Default::default(),
        }
    }

    fn input(pairs: &[(&str, Value)]) -> Input {
        let mut i = Input::new();
        for (k, v) in pairs {
            i.add_entry(*k, v.clone());
        }
        i
    }

    #[test]
    fn renders_input_as_data_model() {
        let out = run(
            &vertex(r#"{"name":"{{ cr }}"}"#, None),
            &input(&[("cr", json!("abc"))]),
        )
        .unwrap();
        assert_eq!(out["out"].data, json!([{"name": "abc"}]));
    }

    #[test]
    fn missing_keys_render_as_empty() {
        let out = run(
            &vertex(r#"{"name":"{{ nope }}"}"#, None),
            &input(&[("cr", json!("abc"))]),
        )
        .unwrap();
        assert_eq!(out["out"].data, json!([{"name": ""}]));
    }

    #[test]
    fn rendered_text_must_be_json() {
        let err = run(&vertex("not json", None), &input(&[])).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn range_renders_once_per_item() {
        let out = run(
            &vertex(r#"{"idx":{{ INDEX }},"value":"{{ VALUE }}"}"#, Some("$cr.names")),
            &input(&[("cr", json!({"names": ["a", "b"]}))]),
        )
        .unwrap();
        assert_eq!(
            out["out"].data,
            json!([{"idx": 0, "value": "a"}, {"idx": 1, "value": "b"}])
        );
    }
}
