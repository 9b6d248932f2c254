use std::collections::BTreeMap;
use std::fmt::Write;

use nutriplan_api::SessionSummary;
use nutriplan_core::{
    BudgetSummary, FoodExplanation, MarkerReading, NeedTrace, NutrientExplanation, NutrientNeed,
    ShoppingListItem, ShoppingPlan,
};

pub fn banner(summary: &SessionSummary) -> String {
    let mut out = String::new();
    let name = summary.display_name.as_deref().unwrap_or(&summary.profile_id);
    let _ = writeln!(out, "Nutriplan session {} for {name}", summary.session_id);
    let _ = writeln!(
        out,
        "ZIP {} | budget tier {} | mobility {} | SNAP {} | WIC {}",
        summary.zip_code,
        summary.budget_tier.as_str(),
        summary.mobility.as_str(),
        yes_no(summary.snap),
        yes_no(summary.wic),
    );
    let _ = writeln!(
        out,
        "{} priorities, {} items, {} unmet. Spent {}, {} remaining.",
        summary.needs, summary.items, summary.unmet, summary.spent, summary.remaining
    );
    for warning in &summary.warnings {
        let _ = writeln!(out, "Note: {warning}");
    }
    out.push_str("Type `help` for commands.");
    out
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

pub fn help() -> String {
    [
        "Commands:",
        "  list              show the shopping list",
        "  why <food>        explain why a food is on the list",
        "  explain <nutrient> explain why a nutrient is prioritized",
        "  nutrients         show prioritized nutrients",
        "  markers           show lab readings against reference ranges",
        "  budget            show the budget breakdown",
        "  stores            show items grouped by store",
        "  help              show this message",
        "  quit              end the session",
    ]
    .join("\n")
}

pub fn shopping_list(plan: &ShoppingPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "SHOPPING LIST ({} items, {} of {})",
        plan.items.len(),
        plan.budget.spent,
        plan.budget.weekly_budget
    );
    for item in &plan.items {
        let addresses = item
            .addresses
            .iter()
            .map(|nutrient| nutrient.display_name())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            out,
            "{:>2}. {} [{}] {} {} - {addresses}",
            item.rank, item.name, item.source, item.price, item.priority
        );
    }
    if !plan.unmet.is_empty() {
        out.push_str("Unmet needs:\n");
        for unmet in &plan.unmet {
            let _ = writeln!(
                out,
                "  - {} ({}): {} {}",
                unmet.nutrient.display_name(),
                unmet.priority,
                unmet.reason.as_str(),
                unmet.message
            );
        }
    }
    out.trim_end().to_string()
}

fn need_trace(out: &mut String, trace: &NeedTrace) {
    let _ = writeln!(out, "  {} ({})", trace.display_name, trace.priority);
    for entry in &trace.justification {
        let _ = writeln!(out, "    - {} [{}]", entry.statement, entry.rule_id);
        for fact in &entry.facts {
            let _ = writeln!(out, "      evidence: {}", fact.describe());
        }
    }
}

pub fn food(explanation: &FoodExplanation) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Why {}?", explanation.name);
    let _ = writeln!(
        out,
        "Rank {} at {} ({}), {}, priority {}",
        explanation.rank,
        explanation.source,
        explanation.travel_class.as_str(),
        explanation.price,
        explanation.priority
    );
    let _ = writeln!(out, "{}", explanation.reason);
    out.push_str("Addresses:\n");
    for trace in &explanation.addressed {
        need_trace(&mut out, trace);
    }
    out.push_str("Chain:\n");
    for line in &explanation.chain {
        let _ = writeln!(out, "  {line}");
    }
    out.trim_end().to_string()
}

pub fn nutrient(explanation: &NutrientExplanation) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} is prioritized {}",
        explanation.need.display_name, explanation.need.priority
    );
    if !explanation.need.related_markers.is_empty() {
        let _ = writeln!(out, "Related markers: {}", explanation.need.related_markers.join(", "));
    }
    need_trace(&mut out, &explanation.need);
    match (&explanation.fulfilled_by, &explanation.unmet) {
        (Some(item), _) => {
            let _ = writeln!(
                out,
                "Covered by #{} {} from {} ({})",
                item.rank, item.name, item.source, item.price
            );
        }
        (None, Some(unmet)) => {
            let _ = writeln!(out, "Not covered ({}): {}", unmet.reason.as_str(), unmet.message);
        }
        (None, None) => out.push_str("Not covered.\n"),
    }
    out.trim_end().to_string()
}

pub fn needs(needs: &[NutrientNeed]) -> String {
    if needs.is_empty() {
        return "No nutrient priorities were identified.".to_string();
    }
    let mut out = String::from("NUTRIENT PRIORITIES\n");
    for (position, need) in needs.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>2}. {} ({}) - {}",
            position + 1,
            need.nutrient.display_name(),
            need.priority,
            need.summary()
        );
    }
    out.trim_end().to_string()
}

pub fn markers(readings: &[MarkerReading]) -> String {
    if readings.is_empty() {
        return "No lab readings were provided.".to_string();
    }
    let mut out = String::from("LAB MARKERS\n");
    for reading in readings {
        let unit = reading.unit.as_deref().map_or_else(String::new, |unit| format!(" {unit}"));
        let _ = writeln!(
            out,
            "  {:<16} {}{unit} ({})",
            reading.marker,
            reading.value,
            reading.status.as_str()
        );
    }
    out.trim_end().to_string()
}

pub fn budget(summary: &BudgetSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "BUDGET ({} tier): spent {} of {}, {} remaining",
        summary.budget_tier.as_str(),
        summary.spent,
        summary.weekly_budget,
        summary.remaining
    );
    for line in &summary.line_items {
        let price = line.price.to_string();
        let _ = writeln!(out, "  {:<32} {price:>8} {}", line.name, line.priority);
    }
    out.push_str("By priority:\n");
    for (priority, total) in summary.by_priority.iter().rev() {
        let _ = writeln!(out, "  {:<10} {total}", priority.label());
    }
    out.trim_end().to_string()
}

pub fn stores(plan: &ShoppingPlan) -> String {
    if plan.items.is_empty() {
        return "No stores are needed.".to_string();
    }
    let mut grouped: BTreeMap<&str, Vec<&ShoppingListItem>> = BTreeMap::new();
    for item in &plan.items {
        grouped.entry(item.source.as_str()).or_default().push(item);
    }

    let mut out = String::from("STORES\n");
    for (source, items) in grouped {
        let travel = items.first().map_or("", |item| item.travel_class.as_str());
        let total = plan.budget.by_source.get(source).copied().unwrap_or_default();
        let _ = writeln!(out, "{source} ({travel}) subtotal {total}");
        for item in items {
            let _ = writeln!(out, "  - {} {}", item.name, item.price);
        }
    }
    out.trim_end().to_string()
}
