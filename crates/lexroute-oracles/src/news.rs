use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use lexroute_core::config::Config;
use lexroute_core::oracle::{NewsAssessor, OracleError};
use lexroute_core::types::{Intake, NewsSignals, NewsSource, Urgency};

const MAX_KEYWORDS: usize = 10;
const MAX_ARTICLE_AGE_DAYS: i64 = 30;

const POLITICAL_TERMS: &[&str] = &[
    "minister", "parliament", "election", "government", "senator", "mayor",
    "corruption", "impeach", "coalition", "opposition party",
];

const PUBLIC_ORDER_TERMS: &[&str] = &[
    "protest", "riot", "unrest", "strike", "demonstration", "curfew", "looting",
];

const MEDIUM_TERMS: &[&str] = &[
    "lawsuit", "investigation", "scandal", "fraud", "arrest", "indictment", "probe",
];

/// Party-name tokens that mark an organization rather than a private
/// individual. Individual names are never sent to the news API.
const ORG_TOKENS: &[&str] = &[
    "ltd", "llc", "inc", "corp", "gmbh", "plc", "s.a.", "ministry", "agency",
    "department", "bank", "holdings", "group", "authority", "council", "university",
];

/// One article as returned by the news API.
#[derive(Debug, Clone, Deserialize)]
pub struct Article {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "publishedAt")]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    articles: Vec<Article>,
}

/// News-backed sensitivity assessor. Fetches recent articles for the
/// case's derived keywords (cached per keyword set), scores them against
/// term lists and recency, and folds in case context multipliers.
pub struct NewsAnalyzer {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, Vec<Article>)>>,
}

impl NewsAnalyzer {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.news_api_url.trim_end_matches('/').to_string(),
            api_key: config.news_api_key.clone(),
            cache_ttl: Duration::from_secs(config.news_cache_ttl_s),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_articles(&self, keywords: &[String]) -> Result<Vec<Article>, OracleError> {
        let cache_key = {
            let mut sorted = keywords.to_vec();
            sorted.sort();
            sorted.join("|")
        };

        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((fetched, articles)) = cache.get(&cache_key) {
                if fetched.elapsed() < self.cache_ttl {
                    return Ok(articles.clone());
                }
            }
        }

        let query = keywords
            .iter()
            .map(|k| format!("\"{k}\""))
            .collect::<Vec<_>>()
            .join(" OR ");
        let url = format!(
            "{}/v2/everything?q={}&sortBy=publishedAt&pageSize=20&apiKey={}",
            self.base_url,
            urlencoding::encode(&query),
            self.api_key,
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(format!("news request: {e}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| OracleError::Unavailable(format!("news response body: {e}")))?;
        if !status.is_success() {
            let detail: String = text.chars().take(300).collect();
            return Err(match status.as_u16() {
                401 | 403 => OracleError::ConfigError(format!("news API rejected key: {detail}")),
                426 | 402 => OracleError::QuotaExceeded(detail),
                429 => OracleError::RateLimited(detail),
                _ => OracleError::Unavailable(format!("news HTTP {status}: {detail}")),
            });
        }

        let parsed: SearchResponse = serde_json::from_str(&text)
            .map_err(|e| OracleError::Unavailable(format!("news returned non-JSON: {e}")))?;
        info!("news search for [{cache_key}] returned {} articles", parsed.articles.len());

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(cache_key, (Instant::now(), parsed.articles.clone()));
        Ok(parsed.articles)
    }
}

#[async_trait]
impl NewsAssessor for NewsAnalyzer {
    async fn assess(
        &self,
        intake: &Intake,
        jurisdiction: &str,
    ) -> Result<NewsSignals, OracleError> {
        if self.api_key.is_empty() {
            return Err(OracleError::ConfigError("NEWS_API_KEY is not set".into()));
        }
        let keywords = derive_keywords(intake, jurisdiction);
        if keywords.is_empty() {
            warn!("no news keywords derivable, returning neutral signals");
            return Ok(NewsSignals::default());
        }
        let articles = self.fetch_articles(&keywords).await?;
        Ok(score_articles(&articles, intake, jurisdiction, Utc::now()))
    }
}

/// Search keywords for a case: subject matter, jurisdiction signals, risk
/// signals, and organization party names. Capped, lowercased, deduplicated.
pub fn derive_keywords(intake: &Intake, jurisdiction: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();
    let mut push = |kw: &str| {
        let kw = kw.trim().to_lowercase();
        if !kw.is_empty() && kw.len() > 2 && seen.insert(kw.clone()) {
            keywords.push(kw);
        }
    };

    push(&intake.subject_matter);
    push(jurisdiction);
    for signal in &intake.jurisdiction_signals {
        push(signal);
    }
    for signal in &intake.risk_signals {
        push(signal);
    }
    for party in &intake.parties {
        if is_organization(&party.name) {
            push(&party.name);
        }
    }

    keywords.truncate(MAX_KEYWORDS);
    keywords
}

fn is_organization(name: &str) -> bool {
    let lower = name.to_lowercase();
    ORG_TOKENS
        .iter()
        .any(|tok| lower.split_whitespace().any(|w| w.trim_matches('.') == *tok))
}

fn recency_factor(published: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(published) = published else {
        return 0.2;
    };
    let age_days = (now - published).num_days();
    if age_days <= 2 {
        1.0
    } else if age_days <= 7 {
        0.8
    } else if age_days <= MAX_ARTICLE_AGE_DAYS {
        0.5
    } else {
        0.0
    }
}

fn term_hits(text: &str, terms: &[&str]) -> usize {
    terms.iter().filter(|t| text.contains(*t)).count()
}

/// Score fetched articles into sensitivity signals. Pure so the scoring
/// rules can be tested without a live API.
pub fn score_articles(
    articles: &[Article],
    intake: &Intake,
    jurisdiction: &str,
    now: DateTime<Utc>,
) -> NewsSignals {
    let jurisdiction_lower = jurisdiction.to_lowercase();
    let mut signals = NewsSignals::default();
    let mut raw_score = 0.0;

    for article in articles {
        let recency = recency_factor(article.published_at, now);
        if recency == 0.0 {
            continue;
        }
        let text = format!(
            "{} {}",
            article.title.to_lowercase(),
            article.description.as_deref().unwrap_or("").to_lowercase()
        );

        let political = term_hits(&text, POLITICAL_TERMS);
        let public_order = term_hits(&text, PUBLIC_ORDER_TERMS);
        let medium = term_hits(&text, MEDIUM_TERMS);
        if political > 0 {
            signals.political_sensitivity = true;
        }
        if public_order > 0 {
            signals.public_order_concern = true;
        }
        if !jurisdiction_lower.is_empty() && text.contains(&jurisdiction_lower) {
            signals.geo_match = true;
        }

        let article_score =
            (2.0 + 12.0 * (political + public_order) as f64 + 6.0 * medium as f64) * recency;
        raw_score += article_score;

        signals.sources.push(NewsSource {
            title: article.title.clone(),
            url: article.url.clone(),
            published_at: article.published_at,
            relevance: (article_score / 30.0).min(1.0),
        });
    }

    if signals.geo_match {
        raw_score *= 1.5;
    }
    raw_score *= match intake.urgency {
        Urgency::Urgent => 1.3,
        Urgency::Moderate => 1.0,
        Urgency::Low => 0.7,
    };
    if !intake.risk_signals.is_empty() {
        raw_score *= 1.2;
    }

    signals.score = raw_score.clamp(0.0, 100.0);
    signals
}
