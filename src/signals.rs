//! Out-of-band signal parsing: the narrow text protocol worker/reviewer/judge
//! output uses to hand structured state back to the controller.

use std::sync::LazyLock;

/// The judge's verdict for one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Advance,
    Iterate,
    Blocked,
}

impl Verdict {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ADVANCE" => Some(Self::Advance),
            "ITERATE" => Some(Self::Iterate),
            "BLOCKED" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// The result of parsing a judge's output for an `AGENTIUM_EVAL` line.
///
/// `signal_found = false` means no line matched at all (fail-closed to
/// `Iterate`); `signal_found = true` covers both a genuinely parsed line and
/// a hard-gate policy rewrite, which must not trip the no-signal counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeResult {
    pub verdict: Verdict,
    pub feedback: String,
    pub signal_found: bool,
}

impl JudgeResult {
    pub fn no_signal_default() -> Self {
        Self {
            verdict: Verdict::Iterate,
            feedback: String::new(),
            signal_found: false,
        }
    }
}

static EVAL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)^AGENTIUM_EVAL:\s+(ADVANCE|ITERATE|BLOCKED)\s*(.*)$")
        .expect("static regex is valid")
});

static STATUS_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)^AGENTIUM_STATUS:\s*(.+)$").expect("static regex is valid")
});

static HANDOFF_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)^AGENTIUM_HANDOFF:\s*(.+)$").expect("static regex is valid")
});

static REVIEW_MODE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)^AGENTIUM_REVIEW_MODE:\s*(FULL|SIMPLE)\s*$").expect("static regex is valid")
});

static MEMORY_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)^AGENTIUM_MEMORY:\s*(\S+)\s+(.+)$").expect("static regex is valid")
});

static PRS_CREATED_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)^PRs_CREATED:\s*\[([^\]]*)\]").expect("static regex is valid")
});

/// Strip a single layer of fenced-code-block delimiters (```` ``` ```` or
/// ` ```lang `) from around text, if present.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_alphanumeric());
        let rest = rest.trim_start_matches('\n');
        if let Some(body) = rest.strip_suffix("```") {
            return body.trim();
        }
    }
    trimmed
}

/// Parse the judge's `AGENTIUM_EVAL` line. Tries the raw text first, then
/// retries once with fences stripped.
pub fn parse_judge_eval(raw_text: &str) -> JudgeResult {
    if let Some(result) = try_parse_eval(raw_text) {
        return result;
    }
    let stripped = strip_fence(raw_text);
    if stripped != raw_text.trim()
        && let Some(result) = try_parse_eval(stripped)
    {
        return result;
    }
    JudgeResult::no_signal_default()
}

fn try_parse_eval(text: &str) -> Option<JudgeResult> {
    let caps = EVAL_RE.captures(text)?;
    let verdict = Verdict::parse(&caps[1])?;
    let feedback = caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    Some(JudgeResult {
        verdict,
        feedback,
        signal_found: true,
    })
}

pub fn extract_status(text: &str) -> Option<String> {
    STATUS_RE.captures(text).map(|c| c[1].trim().to_string())
}

pub fn extract_handoff_json(text: &str) -> Option<String> {
    HANDOFF_RE.captures(text).map(|c| c[1].trim().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewMode {
    Full,
    Simple,
}

pub fn extract_review_mode(text: &str) -> Option<ReviewMode> {
    REVIEW_MODE_RE.captures(text).map(|c| match &c[1] {
        "FULL" => ReviewMode::Full,
        _ => ReviewMode::Simple,
    })
}

pub fn extract_memory_entries(text: &str) -> Vec<(String, String)> {
    MEMORY_RE
        .captures_iter(text)
        .map(|c| (c[1].to_string(), c[2].trim().to_string()))
        .collect()
}

pub fn extract_prs_created(text: &str) -> Vec<u64> {
    let Some(caps) = PRS_CREATED_RE.captures(text) else {
        return Vec::new();
    };
    caps[1]
        .split(',')
        .filter_map(|s| s.trim().parse::<u64>().ok())
        .collect()
}

/// Extract the body between `AGENTIUM_PLAN_START` and `AGENTIUM_PLAN_END`
/// markers, if both are present in order.
pub fn extract_plan_markdown(text: &str) -> Option<String> {
    let start = text.find("AGENTIUM_PLAN_START")?;
    let after_start = start + "AGENTIUM_PLAN_START".len();
    let end_rel = text[after_start..].find("AGENTIUM_PLAN_END")?;
    Some(text[after_start..after_start + end_rel].trim().to_string())
}
