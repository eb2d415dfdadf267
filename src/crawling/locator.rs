//! Element location with ordered fallback strategies
//!
//! A locator holds a priority-ordered list of [`LocateStep`]s. Each step is
//! polled until it finds something or its own timeout runs out; the first
//! success short-circuits the rest. A step without a timeout is tried once.
//! Driver errors inside a step are logged and end that step as
//! [`LocateOutcome::NotFound`].

use std::time::Duration;

use serde_json::json;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::crawling::browser::{BrowserDriver, By, DriverResult, ElementHandle};
use crate::crawling::error::CrawlError;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Waits used by the category selector's first three strategies
pub const CATEGORY_WAITS: [Duration; 3] = [
    Duration::from_secs(10),
    Duration::from_secs(5),
    Duration::from_secs(5),
];

/// Words that mark a submit control in the keyword scan
pub const SUBMIT_KEYWORDS: &[&str] = &["登录", "登錄", "login", "确定", "提交"];

/// Returns the visible elements whose text or value contains `arguments[0]`,
/// dropping any match that merely wraps a deeper match.
pub const TEXT_SCAN_SCRIPT: &str = r"
const needle = arguments[0];
const nodes = Array.from(document.querySelectorAll('button, input, a, div, span, li, td, label'));
const hits = nodes.filter((el) => {
    const text = (el.innerText || el.textContent || '') + ' ' + (el.value || '');
    return text.includes(needle) && el.offsetParent !== null;
});
return hits.filter((el) => !hits.some((other) => other !== el && el.contains(other)));
";

/// Builders for the locators the login flow uses
pub mod selectors {
    use crate::crawling::browser::By;

    /// XPath string literal that survives embedded quotes
    pub fn xpath_literal(value: &str) -> String {
        if !value.contains('\'') {
            format!("'{value}'")
        } else if !value.contains('"') {
            format!("\"{value}\"")
        } else {
            let parts: Vec<String> = value.split('\'').map(|part| format!("'{part}'")).collect();
            format!("concat({})", parts.join(", \"'\", "))
        }
    }

    pub fn exact_text(label: &str) -> By {
        By::xpath(format!("//*[normalize-space(text())={}]", xpath_literal(label)))
    }

    pub fn button_value(label: &str) -> By {
        By::xpath(format!(
            "//input[(@type='button' or @type='submit') and @value={}]",
            xpath_literal(label)
        ))
    }

    pub fn text_or_value_contains(label: &str) -> By {
        let literal = xpath_literal(label);
        By::xpath(format!(
            "//*[self::button or self::input or self::a or self::div][contains(text(), {literal}) or contains(@value, {literal})]"
        ))
    }

    pub fn submit_by_type() -> By {
        By::css("button[type='submit'], input[type='submit']")
    }

    pub fn submit_by_text() -> By {
        By::xpath("//button[contains(text(), '登录') or contains(text(), '登錄') or contains(text(), 'Login')]")
    }

    pub fn submit_by_value() -> By {
        By::xpath("//input[contains(@value, '登录') or contains(@value, '登錄') or contains(@value, 'Login')]")
    }

    /// Tag names walked by the keyword scan
    pub fn scan_candidates() -> Vec<By> {
        vec![By::tag("button"), By::tag("input"), By::tag("a")]
    }
}

/// How one step looks for its element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Direct lookup
    Selector(By),
    /// Walk candidate elements and match their text or `value` against needles
    Scan {
        candidates: Vec<By>,
        needles: Vec<String>,
        ignore_case: bool,
    },
    /// In-page script over every node ([`TEXT_SCAN_SCRIPT`])
    Script { needle: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateStep {
    pub name: &'static str,
    pub strategy: Strategy,
    /// `None` means a single attempt
    pub timeout: Option<Duration>,
    /// Only accept displayed and enabled elements
    pub require_clickable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateOutcome {
    Found(ElementHandle),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct ElementLocator {
    target: String,
    steps: Vec<LocateStep>,
    poll_interval: Duration,
}

impl ElementLocator {
    pub fn new(target: impl Into<String>, steps: Vec<LocateStep>) -> Self {
        Self {
            target: target.into(),
            steps,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Exact text, button value, substring, then a script scan
    pub fn category_selector(label: &str) -> Self {
        Self::category_selector_with_waits(label, CATEGORY_WAITS)
    }

    pub fn category_selector_with_waits(label: &str, waits: [Duration; 3]) -> Self {
        let [exact_wait, value_wait, contains_wait] = waits;
        Self::new(
            label,
            vec![
                LocateStep {
                    name: "exact-text",
                    strategy: Strategy::Selector(selectors::exact_text(label)),
                    timeout: Some(exact_wait),
                    require_clickable: true,
                },
                LocateStep {
                    name: "button-value",
                    strategy: Strategy::Selector(selectors::button_value(label)),
                    timeout: Some(value_wait),
                    require_clickable: true,
                },
                LocateStep {
                    name: "text-or-value-contains",
                    strategy: Strategy::Selector(selectors::text_or_value_contains(label)),
                    timeout: Some(contains_wait),
                    require_clickable: true,
                },
                LocateStep {
                    name: "script-scan",
                    strategy: Strategy::Script { needle: label.to_string() },
                    timeout: None,
                    require_clickable: true,
                },
            ],
        )
    }

    /// By type, by text, by value, then a keyword scan; each tried once
    pub fn submit_control() -> Self {
        Self::new(
            "submit",
            vec![
                LocateStep {
                    name: "submit-type",
                    strategy: Strategy::Selector(selectors::submit_by_type()),
                    timeout: None,
                    require_clickable: false,
                },
                LocateStep {
                    name: "submit-text",
                    strategy: Strategy::Selector(selectors::submit_by_text()),
                    timeout: None,
                    require_clickable: false,
                },
                LocateStep {
                    name: "submit-value",
                    strategy: Strategy::Selector(selectors::submit_by_value()),
                    timeout: None,
                    require_clickable: false,
                },
                LocateStep {
                    name: "keyword-scan",
                    strategy: Strategy::Scan {
                        candidates: selectors::scan_candidates(),
                        needles: SUBMIT_KEYWORDS.iter().map(ToString::to_string).collect(),
                        ignore_case: true,
                    },
                    timeout: None,
                    require_clickable: true,
                },
            ],
        )
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn steps(&self) -> &[LocateStep] {
        &self.steps
    }

    /// Run the strategies in order and return the first match
    pub async fn locate(&self, driver: &dyn BrowserDriver) -> Result<ElementHandle, CrawlError> {
        for step in &self.steps {
            match self.run_step(driver, step).await {
                LocateOutcome::Found(element) => {
                    debug!(target_label = %self.target, strategy = step.name, "element located");
                    return Ok(element);
                }
                LocateOutcome::NotFound => {
                    debug!(target_label = %self.target, strategy = step.name, "strategy found nothing");
                }
            }
        }

        Err(CrawlError::ElementNotFound {
            target: self.target.clone(),
            attempted: self.steps.iter().map(|s| s.name.to_string()).collect(),
        })
    }

    /// Poll one strategy until it matches or its timeout elapses
    pub async fn run_step(&self, driver: &dyn BrowserDriver, step: &LocateStep) -> LocateOutcome {
        let deadline = step.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            match Self::attempt(driver, step).await {
                Ok(Some(element)) => return LocateOutcome::Found(element),
                Ok(None) => {}
                Err(e) => {
                    warn!(target_label = %self.target, strategy = step.name, error = %e, "strategy failed");
                    return LocateOutcome::NotFound;
                }
            }

            let Some(deadline) = deadline else {
                return LocateOutcome::NotFound;
            };
            let now = Instant::now();
            if now >= deadline {
                return LocateOutcome::NotFound;
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn attempt(driver: &dyn BrowserDriver, step: &LocateStep) -> DriverResult<Option<ElementHandle>> {
        let candidates = match &step.strategy {
            Strategy::Selector(by) => driver.find_elements(by).await?,
            Strategy::Script { needle } => {
                driver
                    .find_elements_by_script(TEXT_SCAN_SCRIPT, vec![json!(needle)])
                    .await?
            }
            Strategy::Scan {
                candidates,
                needles,
                ignore_case,
            } => return Self::scan(driver, candidates, needles, *ignore_case).await,
        };

        for element in candidates {
            if !step.require_clickable || driver.is_clickable(&element).await? {
                return Ok(Some(element));
            }
        }
        Ok(None)
    }

    async fn scan(
        driver: &dyn BrowserDriver,
        candidates: &[By],
        needles: &[String],
        ignore_case: bool,
    ) -> DriverResult<Option<ElementHandle>> {
        let needles: Vec<String> = if ignore_case {
            needles.iter().map(|n| n.to_lowercase()).collect()
        } else {
            needles.to_vec()
        };

        for by in candidates {
            for element in driver.find_elements(by).await? {
                if !driver.is_clickable(&element).await? {
                    continue;
                }
                let text = driver.element_text(&element).await?;
                let value = driver.element_attribute(&element, "value").await?.unwrap_or_default();
                let mut haystack = format!("{text} {value}");
                if ignore_case {
                    haystack = haystack.to_lowercase();
                }
                if needles.iter().any(|needle| haystack.contains(needle.as_str())) {
                    return Ok(Some(element));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeElement, ScriptedBrowser};
    use rstest::rstest;

    #[rstest]
    #[case("师门", "'师门'")]
    #[case("it's", "\"it's\"")]
    #[case("a'b\"c", "concat('a', \"'\", 'b\"c')")]
    fn xpath_literals_are_quoted(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(selectors::xpath_literal(input), expected);
    }

    #[test]
    fn category_strategies_are_ordered_with_decreasing_waits() {
        let locator = ElementLocator::category_selector("师门");
        let names: Vec<_> = locator.steps().iter().map(|s| s.name).collect();
        assert_eq!(names, ["exact-text", "button-value", "text-or-value-contains", "script-scan"]);
        let timeouts: Vec<_> = locator.steps().iter().map(|s| s.timeout).collect();
        assert_eq!(
            timeouts,
            [
                Some(Duration::from_secs(10)),
                Some(Duration::from_secs(5)),
                Some(Duration::from_secs(5)),
                None
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_matching_strategy_wins() -> anyhow::Result<()> {
        let browser = ScriptedBrowser::with_elements(vec![
            FakeElement::new("input")
                .attr("type", "button")
                .attr("value", "师门")
                .matching(selectors::button_value("师门")),
        ]);

        let locator = ElementLocator::category_selector("师门");
        let found = locator.locate(&browser).await?;
        assert_eq!(browser.element_index(&found), Some(0));
        // the exact-text strategy polled through its full wait first
        assert!(browser.lookups(&selectors::exact_text("师门")) > 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_script_scan() -> anyhow::Result<()> {
        let browser = ScriptedBrowser::with_elements(vec![FakeElement::new("span").text("进入师门")]);
        let found = ElementLocator::category_selector("师门").locate(&browser).await?;
        assert_eq!(browser.element_index(&found), Some(0));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unclickable_matches_are_ignored() {
        let browser = ScriptedBrowser::with_elements(vec![
            FakeElement::new("div")
                .text("师门")
                .clickable(false)
                .matching(selectors::exact_text("师门")),
        ]);
        let result = ElementLocator::category_selector("师门").locate(&browser).await;
        assert!(matches!(result, Err(CrawlError::ElementNotFound { ref attempted, .. }) if attempted.len() == 4));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_keyword_scan_ignores_case() -> anyhow::Result<()> {
        let browser = ScriptedBrowser::with_elements(vec![
            FakeElement::new("a").text("Cancel"),
            FakeElement::new("a").text("LOGIN now"),
        ]);
        let found = ElementLocator::submit_control().locate(&browser).await?;
        assert_eq!(browser.element_index(&found), Some(1));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn submit_by_type_is_preferred() -> anyhow::Result<()> {
        let browser = ScriptedBrowser::with_elements(vec![
            FakeElement::new("button").text("登录"),
            FakeElement::new("button")
                .attr("type", "submit")
                .text("Go")
                .matching(selectors::submit_by_type()),
        ]);
        let found = ElementLocator::submit_control().locate(&browser).await?;
        assert_eq!(browser.element_index(&found), Some(1));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn driver_errors_count_as_not_found() {
        let browser = ScriptedBrowser::with_elements(Vec::new());
        browser.fail_lookups(true);
        let result = ElementLocator::submit_control().locate(&browser).await;
        assert!(matches!(result, Err(CrawlError::ElementNotFound { .. })));
    }
}
