//! Static rule table mapping request paths to buckets and strategies.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

/// How a bucket balances freshness against network use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
  /// Serve fresh cache without touching the network
  CacheFirst,
  /// Serve cache immediately and refresh it in the background
  StaleWhileRevalidate,
  /// Ask the network first, fall back to cache
  NetworkFirst,
}

impl fmt::Display for CacheStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CacheStrategy::CacheFirst => write!(f, "cache-first"),
      CacheStrategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
      CacheStrategy::NetworkFirst => write!(f, "network-first"),
    }
  }
}

/// One asset class: any matching pattern selects this bucket and strategy.
#[derive(Debug, Clone)]
pub struct CacheRule {
  /// Asset class name, also the middle part of the bucket name
  pub class: &'static str,
  pub patterns: Vec<Regex>,
  pub bucket: String,
  pub strategy: CacheStrategy,
  pub max_age: Duration,
}

impl CacheRule {
  pub fn matches(&self, path: &str) -> bool {
    self.patterns.iter().any(|p| p.is_match(path))
  }
}

struct RuleTemplate {
  class: &'static str,
  patterns: Vec<Regex>,
  strategy: CacheStrategy,
  max_age: Duration,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
  patterns
    .iter()
    .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("Invalid cache rule pattern {p}: {e}")))
    .collect()
}

/// Default table in match order. Earlier groups win.
static DEFAULT_RULES: Lazy<Vec<RuleTemplate>> = Lazy::new(|| {
  vec![
    RuleTemplate {
      class: "css-core",
      patterns: compile(&[r"(?:^|/)(?:core|main|base|critical)(?:[.-][0-9A-Za-z_-]+)*\.css$"]),
      strategy: CacheStrategy::CacheFirst,
      max_age: Duration::from_secs(30 * DAY),
    },
    RuleTemplate {
      class: "css-conditional",
      patterns: compile(&[
        r"/themes?/[^/]+\.css$",
        r"(?:^|/)(?:print|dark|light|rtl)(?:[.-][0-9A-Za-z_-]+)*\.css$",
        r"/components?/[^/]+\.css$",
      ]),
      strategy: CacheStrategy::StaleWhileRevalidate,
      max_age: Duration::from_secs(7 * DAY),
    },
    RuleTemplate {
      class: "js-vendor",
      patterns: compile(&[
        r"/(?:vendor|vendors|lib|node_modules)/.+\.m?js$",
        r"(?:^|/)vendors?(?:[.~-][0-9A-Za-z_-]+)*\.m?js$",
      ]),
      strategy: CacheStrategy::CacheFirst,
      max_age: Duration::from_secs(30 * DAY),
    },
    RuleTemplate {
      class: "js-app",
      patterns: compile(&[r"(?:^|/)(?:app|main|index|bundle)(?:[.-][0-9A-Za-z_-]+)*\.m?js$"]),
      strategy: CacheStrategy::StaleWhileRevalidate,
      max_age: Duration::from_secs(DAY),
    },
    RuleTemplate {
      class: "js-chunks",
      patterns: compile(&[
        r"/chunks?/.+\.m?js$",
        r"(?:^|/)chunk[.-].+\.m?js$",
        r"[.-][0-9a-f]{8,}\.m?js$",
      ]),
      strategy: CacheStrategy::CacheFirst,
      max_age: Duration::from_secs(7 * DAY),
    },
    RuleTemplate {
      class: "fonts",
      patterns: compile(&[r"\.(?:woff2?|ttf|otf|eot)$"]),
      strategy: CacheStrategy::CacheFirst,
      max_age: Duration::from_secs(365 * DAY),
    },
    RuleTemplate {
      class: "images",
      patterns: compile(&[r"\.(?:png|jpe?g|gif|webp|avif|svg|ico)$"]),
      strategy: CacheStrategy::StaleWhileRevalidate,
      max_age: Duration::from_secs(30 * DAY),
    },
    RuleTemplate {
      class: "api",
      patterns: compile(&[r"^/api/", r"/v1/forecast$", r"^/(?:search|reverse)$"]),
      strategy: CacheStrategy::NetworkFirst,
      max_age: Duration::from_secs(5 * MINUTE),
    },
  ]
});

/// The rule table of one engine, with bucket names bound to a version.
#[derive(Debug, Clone)]
pub struct CacheRules {
  rules: Vec<CacheRule>,
  fallback: CacheRule,
}

impl CacheRules {
  /// Default table with buckets named `{prefix}-{class}-{version}`.
  ///
  /// Bumping `version` renames every bucket, which orphans the old ones.
  pub fn new(prefix: &str, version: &str) -> Self {
    let bucket = |class: &str| format!("{}-{}-{}", prefix, class, version);

    let rules = DEFAULT_RULES
      .iter()
      .map(|template| CacheRule {
        class: template.class,
        patterns: template.patterns.clone(),
        bucket: bucket(template.class),
        strategy: template.strategy,
        max_age: template.max_age,
      })
      .collect();

    let fallback = CacheRule {
      class: "static",
      patterns: Vec::new(),
      bucket: bucket("static"),
      strategy: CacheStrategy::NetworkFirst,
      max_age: Duration::from_secs(DAY),
    };

    Self { rules, fallback }
  }

  /// First rule whose patterns match `path`.
  pub fn classify(&self, path: &str) -> Option<&CacheRule> {
    self.rules.iter().find(|rule| rule.matches(path))
  }

  /// Rule for `path`, falling back to the static asset rule.
  pub fn resolve(&self, path: &str) -> &CacheRule {
    self.classify(path).unwrap_or(&self.fallback)
  }

  /// Rule owning `bucket`, if any.
  pub fn for_bucket(&self, bucket: &str) -> Option<&CacheRule> {
    self.iter().find(|rule| rule.bucket == bucket)
  }

  /// Every rule including the fallback.
  pub fn iter(&self) -> impl Iterator<Item = &CacheRule> {
    self.rules.iter().chain(std::iter::once(&self.fallback))
  }

  pub fn bucket_names(&self) -> Vec<String> {
    self.iter().map(|rule| rule.bucket.clone()).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn class_of(rules: &CacheRules, path: &str) -> Option<&'static str> {
    rules.classify(path).map(|rule| rule.class)
  }

  #[test]
  fn test_css_groups() {
    let rules = CacheRules::new("nimbus", "v1");
    assert_eq!(class_of(&rules, "/assets/css/core.css"), Some("css-core"));
    assert_eq!(class_of(&rules, "/css/main.4f2a.css"), Some("css-core"));
    assert_eq!(class_of(&rules, "/css/themes/ocean.css"), Some("css-conditional"));
    assert_eq!(class_of(&rules, "/css/print.css"), Some("css-conditional"));
    assert_eq!(class_of(&rules, "/css/widgets.css"), None);
  }

  #[test]
  fn test_script_groups_in_order() {
    let rules = CacheRules::new("nimbus", "v1");
    assert_eq!(class_of(&rules, "/vendor/chart.js"), Some("js-vendor"));
    assert_eq!(class_of(&rules, "/js/vendors~main.js"), Some("js-vendor"));
    // Hashed app bundle is still the app, not a chunk
    assert_eq!(class_of(&rules, "/assets/js/app.3f9a8b7c.js"), Some("js-app"));
    assert_eq!(class_of(&rules, "/js/chunks/radar.js"), Some("js-chunks"));
    assert_eq!(class_of(&rules, "/js/chunk-settings.js"), Some("js-chunks"));
    assert_eq!(class_of(&rules, "/js/settings.3f9a8b7c21.js"), Some("js-chunks"));
  }

  #[test]
  fn test_other_classes_and_fallback() {
    let rules = CacheRules::new("nimbus", "v1");
    assert_eq!(class_of(&rules, "/fonts/inter.woff2"), Some("fonts"));
    assert_eq!(class_of(&rules, "/icons/sun.svg"), Some("images"));
    assert_eq!(class_of(&rules, "/v1/forecast"), Some("api"));
    assert_eq!(class_of(&rules, "/api/alerts"), Some("api"));

    let fallback = rules.resolve("/index.html");
    assert_eq!(fallback.class, "static");
    assert_eq!(fallback.strategy, CacheStrategy::NetworkFirst);
  }

  #[test]
  fn test_bucket_names_carry_version() {
    let rules = CacheRules::new("nimbus", "v2");
    let names = rules.bucket_names();
    assert!(names.contains(&"nimbus-css-core-v2".to_string()));
    assert!(names.contains(&"nimbus-static-v2".to_string()));
    assert_eq!(names.len(), 9);
    assert_eq!(
      rules.for_bucket("nimbus-fonts-v2").map(|r| r.strategy),
      Some(CacheStrategy::CacheFirst)
    );
  }
}
