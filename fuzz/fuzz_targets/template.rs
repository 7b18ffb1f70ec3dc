//! Fuzz target for filter template rendering.
//!
//! Any pattern and value must render without panicking, and a text value
//! must never leave an unbalanced quote behind.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use model_stats::stats::filter::render_template;
use model_stats::stats::{Constraint, FilterValue};

#[derive(Arbitrary, Debug)]
struct TemplateInput {
    pattern: String,
    value: String,
    table: String,
}

fuzz_target!(|input: TemplateInput| {
    let value = FilterValue::Text(input.value);
    let Ok(Constraint::Sql(rendered)) = render_template("key", "?", &value, &input.table) else {
        panic!("text values always render");
    };
    assert_eq!(rendered.matches('\'').count() % 2, 0);

    let _ = render_template("key", &input.pattern, &value, &input.table);
});
