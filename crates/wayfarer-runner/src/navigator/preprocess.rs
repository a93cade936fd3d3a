use std::collections::HashMap;

use serde_json::json;
use tracing::{debug, warn};

use crate::actions::ActionKind;
use crate::model::ProposedAction;

/// Inputs that shape a batch before it runs.
#[derive(Debug, Clone, Copy)]
pub struct Preprocess {
    pub max_actions: usize,
    /// No surface is bound yet.
    pub cold_start: bool,
    /// A paginated read already ran against a page with the batch-start
    /// signature on an earlier step.
    pub signature_seen: bool,
}

/// Normalize a proposed batch.
///
/// 1. Truncate to `max_actions`.
/// 2. On cold start, move navigation to the front (stable).
/// 3. Drop read-only actions repeated on an unchanged page. A repeated
///    paginated read is collapsed to one read preceded by `next_page`, as is
///    a paginated read of a page already read on an earlier step.
///
/// "Unchanged page" means no action other than a read or `wait` ran in
/// between.
pub fn preprocess(mut actions: Vec<ProposedAction>, opts: &Preprocess) -> Vec<ProposedAction> {
    if actions.len() > opts.max_actions {
        warn!(
            "Batch of {} actions truncated to {}",
            actions.len(),
            opts.max_actions
        );
        actions.truncate(opts.max_actions);
    }

    if opts.cold_start {
        let (nav, rest): (Vec<_>, Vec<_>) = actions
            .into_iter()
            .partition(|a| ActionKind::from_name(&a.name).is_some_and(|k| k.is_navigation()));
        actions = nav.into_iter().chain(rest).collect();
    }

    // (action, needs next_page before it)
    let mut kept: Vec<(ProposedAction, bool)> = Vec::with_capacity(actions.len());
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut epoch = 0usize;

    for action in actions {
        let kind = ActionKind::from_name(&action.name);
        match kind {
            Some(k) if k.is_read_only() => {
                let key = format!("{}|{}", epoch, action.key());
                if let Some(&pos) = first_seen.get(&key) {
                    debug!("Dropping repeated {} on an unchanged page", action.name);
                    if k.is_paginated_read() {
                        kept[pos].1 = true;
                    }
                    continue;
                }
                first_seen.insert(key, kept.len());
                let seen_before = k.is_paginated_read() && epoch == 0 && opts.signature_seen;
                kept.push((action, seen_before));
            }
            Some(ActionKind::Wait) => kept.push((action, false)),
            _ => {
                epoch += 1;
                kept.push((action, false));
            }
        }
    }

    let mut out: Vec<ProposedAction> = Vec::with_capacity(kept.len() + 1);
    for (action, needs_next) in kept {
        let after_next = out
            .last()
            .is_some_and(|a| a.name == ActionKind::NextPage.name());
        if needs_next && !after_next {
            debug!("Inserting next_page before {}", action.name);
            out.push(ProposedAction::new(ActionKind::NextPage.name(), json!({})));
        }
        out.push(action);
    }
    out
}
