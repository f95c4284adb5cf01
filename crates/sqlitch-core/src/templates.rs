//! Script scaffolding templates.
//!
//! `init` writes these bodies under `etc/templates/<kind>/<engine>.tmpl`;
//! `add` renders whichever template is present (falling back to the
//! built-ins) into `deploy/`, `revert/`, and `verify/` scripts. The
//! dialect is the small `[% … %]` subset the reference tool uses: scalar
//! tags plus `FOREACH` blocks over the dependency lists, with `-%]`
//! chomping the following newline.

/// Deploy script template.
pub const DEPLOY_TEMPLATE: &str = "-- Deploy [% project %]:[% change %] to [% engine %]\n\
[% FOREACH item IN requires -%]\n\
-- requires: [% item %]\n\
[% END -%]\n\
[% FOREACH item IN conflicts -%]\n\
-- conflicts: [% item %]\n\
[% END -%]\n\
\n\
BEGIN;\n\
\n\
-- XXX Add DDLs here.\n\
\n\
COMMIT;\n";

/// Revert script template.
pub const REVERT_TEMPLATE: &str = "-- Revert [% project %]:[% change %] from [% engine %]\n\
\n\
BEGIN;\n\
\n\
-- XXX Add DDLs here.\n\
\n\
COMMIT;\n";

/// Verify script template.
pub const VERIFY_TEMPLATE: &str = "-- Verify [% project %]:[% change %] on [% engine %]\n\
\n\
BEGIN;\n\
\n\
-- XXX Add verifications here.\n\
\n\
ROLLBACK;\n";

/// The three script kinds, in scaffold order.
pub const TEMPLATE_KINDS: [(&str, &str); 3] = [
    ("deploy", DEPLOY_TEMPLATE),
    ("revert", REVERT_TEMPLATE),
    ("verify", VERIFY_TEMPLATE),
];

/// Values available to a template.
#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    pub project: &'a str,
    pub change: &'a str,
    pub engine: &'a str,
    pub requires: &'a [String],
    pub conflicts: &'a [String],
}

/// Render a template against the given variables.
pub fn render_template(template: &str, vars: &TemplateVars<'_>) -> String {
    let mut out = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("[% FOREACH item IN ") {
        out.push_str(&rest[..start]);
        let after_tag = &rest[start + "[% FOREACH item IN ".len()..];
        let Some(open_end) = after_tag.find("-%]") else {
            // Malformed block: emit literally.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let list_name = after_tag[..open_end].trim();
        let body_start = chomp_newline(&after_tag[open_end + "-%]".len()..]);
        let Some(end_tag) = body_start.find("[% END -%]") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let body = &body_start[..end_tag];
        let items: &[String] = match list_name {
            "requires" => vars.requires,
            "conflicts" => vars.conflicts,
            _ => &[],
        };
        for item in items {
            out.push_str(&body.replace("[% item %]", item));
        }
        rest = chomp_newline(&body_start[end_tag + "[% END -%]".len()..]);
    }
    out.push_str(rest);

    out.replace("[% project %]", vars.project)
        .replace("[% change %]", vars.change)
        .replace("[% engine %]", vars.engine)
}

fn chomp_newline(text: &str) -> &str {
    text.strip_prefix('\n').unwrap_or(text)
}
