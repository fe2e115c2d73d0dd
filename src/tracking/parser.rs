use std::sync::LazyLock;

use regex::Regex;

/// Glyphs the tracking table renders in its state column. Whitespace
/// around the glyph is cosmetic and must be tolerated (§6).
const PENDING_GLYPH: &str = "·";
const ACTIVE_GLYPH: &str = "▶";
const DONE_GLYPH: &str = "✓";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Active,
    Done,
}

impl StepState {
    fn from_glyph(raw: &str) -> Option<Self> {
        match raw.trim() {
            g if g == PENDING_GLYPH => Some(StepState::Pending),
            g if g == ACTIVE_GLYPH => Some(StepState::Active),
            g if g == DONE_GLYPH => Some(StepState::Done),
            _ => None,
        }
    }

    fn glyph(self) -> &'static str {
        match self {
            StepState::Pending => PENDING_GLYPH,
            StepState::Active => ACTIVE_GLYPH,
            StepState::Done => DONE_GLYPH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRow {
    pub status_column: String,
    pub agent: String,
    pub state: StepState,
}

/// Matches a single table body row: `| Status | Agent | Glyph |`, tolerant
/// of extra padding around each cell. The header and separator rows never
/// match because their state cell isn't one of the three known glyphs.
static ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\|\s*([^|\n]+?)\s*\|\s*([^|\n]+?)\s*\|\s*([^|\n]+?)\s*\|\s*$").unwrap()
});

/// Parses every tracking-table row out of an issue body.
pub fn parse(body: &str) -> Vec<TrackingRow> {
    ROW_RE
        .captures_iter(body)
        .filter_map(|caps| {
            let state = StepState::from_glyph(&caps[3])?;
            Some(TrackingRow {
                status_column: caps[1].trim().to_string(),
                agent: caps[2].trim().to_string(),
                state,
            })
        })
        .collect()
}

/// The agent currently marked `active`, if any (invariant I2: at most one).
pub fn current_active(body: &str) -> Option<String> {
    parse(body)
        .into_iter()
        .find(|row| row.state == StepState::Active)
        .map(|row| row.agent)
}

/// The first `pending` agent in table order, if any.
pub fn next_pending(body: &str) -> Option<String> {
    parse(body)
        .into_iter()
        .find(|row| row.state == StepState::Pending)
        .map(|row| row.agent)
}

fn rewrite_state(body: &str, agent: &str, target: StepState) -> String {
    let mut out = String::with_capacity(body.len());
    let mut last_end = 0;
    for caps in ROW_RE.captures_iter(body) {
        let whole = caps.get(0).unwrap();
        let row_agent = caps[2].trim();
        out.push_str(&body[last_end..whole.start()]);
        if row_agent == agent {
            let glyph_match = caps.get(3).unwrap();
            out.push_str(&body[whole.start()..glyph_match.start()]);
            out.push_str(target.glyph());
            out.push_str(&body[glyph_match.end()..whole.end()]);
        } else {
            out.push_str(whole.as_str());
        }
        last_end = whole.end();
    }
    out.push_str(&body[last_end..]);
    out
}

/// Marks `agent` active, first demoting any previously active step to
/// `done` (idempotent: calling twice in a row is a no-op the second time).
pub fn mark_active(body: &str, agent: &str) -> String {
    let mut updated = body.to_string();
    if let Some(prev) = current_active(body) {
        if prev != agent {
            updated = rewrite_state(&updated, &prev, StepState::Done);
        }
    }
    rewrite_state(&updated, agent, StepState::Active)
}

/// Marks `agent` done (idempotent).
pub fn mark_done(body: &str, agent: &str) -> String {
    rewrite_state(body, agent, StepState::Done)
}
