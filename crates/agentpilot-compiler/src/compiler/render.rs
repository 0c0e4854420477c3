//! Rendering lowering.
//!
//! Rendering becomes a `set` transform whose template sees the transform
//! input as `input` (plus any in-scope binding such as `item`). Generated
//! templates are built from the column list only, so identical IR always
//! yields identical template text.

use serde_json::json;

use super::context::{Cursor, Lowering};
use super::stages::transform_step;
use crate::ir::{RenderType, RenderingRule};
use crate::workflow::{TransformOperation, WorkflowStep};

/// Whether the template renders one record or a list of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenderScope {
    Record,
    List,
}

fn cell(column: &str) -> String {
    // Bracket access keeps columns with spaces or dashes usable.
    format!("{{{{ row[{}] }}}}", serde_json::Value::String(column.to_string()))
}

fn table_row(columns: &[String]) -> String {
    let cells: String = columns
        .iter()
        .map(|c| format!("<td>{}</td>", cell(c)))
        .collect();
    format!("<tr>{}</tr>", cells)
}

fn list_line(columns: &[String]) -> String {
    if columns.is_empty() {
        "{{ row }}".to_string()
    } else {
        columns
            .iter()
            .map(|c| cell(c))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Template text for a rendering rule, or `None` when the data is passed as is.
pub(crate) fn template_for(rule: &RenderingRule, scope: RenderScope) -> Option<String> {
    match rule.render_type {
        RenderType::Json => None,
        RenderType::Template => rule.template.clone(),
        RenderType::HtmlTable => {
            let header: String = rule
                .columns
                .iter()
                .map(|c| format!("<th>{}</th>", c))
                .collect();
            let body = match scope {
                RenderScope::List => {
                    format!("{{% for row in input %}}{}{{% endfor %}}", table_row(&rule.columns))
                }
                RenderScope::Record => {
                    format!("{{% set row = input %}}{}", table_row(&rule.columns))
                }
            };
            Some(format!(
                "<table><thead><tr>{}</tr></thead><tbody>{}</tbody></table>",
                header, body
            ))
        }
        RenderType::PlainList => Some(match scope {
            RenderScope::List => format!(
                "{{% for row in input %}}- {}\n{{% endfor %}}",
                list_line(&rule.columns)
            ),
            RenderScope::Record => {
                format!("{{% set row = input %}}{}", list_line(&rule.columns))
            }
        }),
    }
}

/// Add a render step reading `cursor`, if the IR asks for rendering.
pub(crate) fn lower_render(
    rendering: Option<&RenderingRule>,
    scope: RenderScope,
    lowering: &mut Lowering,
    steps: &mut Vec<WorkflowStep>,
    cursor: Cursor,
) -> Cursor {
    let Some(template) = rendering.and_then(|r| template_for(r, scope)) else {
        return cursor;
    };

    let id = lowering.next_id();
    steps.push(
        transform_step(
            &id,
            "Render content",
            TransformOperation::Set,
            &cursor.reference,
            json!({ "template": template }),
        )
        .depends_on([cursor.step_id]),
    );
    Cursor::data_of(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(render_type: RenderType, columns: &[&str]) -> RenderingRule {
        RenderingRule {
            render_type,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_html_table_template() {
        let tpl = template_for(&rule(RenderType::HtmlTable, &["name", "due date"]), RenderScope::List)
            .unwrap();
        assert_eq!(
            tpl,
            "<table><thead><tr><th>name</th><th>due date</th></tr></thead><tbody>\
             {% for row in input %}<tr><td>{{ row[\"name\"] }}</td><td>{{ row[\"due date\"] }}</td></tr>{% endfor %}\
             </tbody></table>"
        );
    }

    #[test]
    fn test_plain_list_record_template() {
        let tpl = template_for(&rule(RenderType::PlainList, &["subject", "from"]), RenderScope::Record)
            .unwrap();
        assert_eq!(tpl, "{% set row = input %}{{ row[\"subject\"] }} | {{ row[\"from\"] }}");
    }

    #[test]
    fn test_json_passes_through() {
        assert!(template_for(&rule(RenderType::Json, &[]), RenderScope::List).is_none());

        let mut lowering = Lowering::default();
        let mut steps = Vec::new();
        let cursor = Cursor::data_of("step3");
        let out = lower_render(
            Some(&rule(RenderType::Json, &[])),
            RenderScope::List,
            &mut lowering,
            &mut steps,
            cursor.clone(),
        );
        assert_eq!(out, cursor);
        assert!(steps.is_empty());
    }

    #[test]
    fn test_custom_template_step() {
        let rendering = RenderingRule {
            render_type: RenderType::Template,
            template: Some("{{ input | length }} new invoices".to_string()),
            ..Default::default()
        };
        let mut lowering = Lowering::default();
        let mut steps = Vec::new();
        let out = lower_render(
            Some(&rendering),
            RenderScope::List,
            &mut lowering,
            &mut steps,
            Cursor::data_of("step2"),
        );
        assert_eq!(out.reference, "{{step1.data}}");
        assert_eq!(steps[0].dependencies.iter().next().map(|s| s.as_str()), Some("step2"));
    }
}
