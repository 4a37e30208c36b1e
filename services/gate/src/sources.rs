//! Loading admitted prefixes.
//!
//! The index is built once at startup from a static loopback entry, the
//! user's allow list, remote prefix lists (one CIDR per line) and the prefix
//! tables a looking glass publishes for each ASN. Malformed remote entries are
//! skipped; a malformed local entry or a failed fetch aborts startup.

use anyhow::{anyhow, Context, Result};
use edgegate_networking::PrefixIndex;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

/// Always admitted, regardless of configuration.
pub const DEFAULT_ALLOW: &[&str] = &["127.0.0.1/32"];

const ASN_PREFIX_SELECTORS: &[&str] = &[
    "#table_prefixes4 > tbody > tr > td:nth-child(1) > a",
    "#table_prefixes6 > tbody > tr > td:nth-child(1) > a",
];

/// Where admitted prefixes come from.
#[derive(Debug, Clone, Default)]
pub struct RangeSources {
    /// CIDRs supplied by the user. Each must parse.
    pub allow: Vec<String>,
    /// URLs of plain-text prefix lists.
    pub list_urls: Vec<String>,
    /// Autonomous systems whose announced prefixes are admitted.
    pub asns: Vec<u32>,
    /// Base URL of the ASN prefix tables.
    pub asn_base_url: String,
    /// Fetch `list_urls` and `asns`. When false only local entries are used.
    pub fetch_remote: bool,
}

/// Fetch a plain-text prefix list and insert every valid line.
///
/// Returns the number of prefixes inserted.
pub async fn load_list(index: &mut PrefixIndex, client: &reqwest::Client, url: &str) -> Result<usize> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to fetch prefix list {}", url))?;

    if !resp.status().is_success() {
        return Err(anyhow!(
            "prefix list query failed (status={}): {}",
            resp.status(),
            url
        ));
    }

    let body = resp
        .text()
        .await
        .with_context(|| format!("failed to read prefix list {}", url))?;

    let lines: Vec<&str> = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let skipped = index.extend_lossy(lines.iter().copied());
    if skipped > 0 {
        warn!(url = %url, skipped, "Skipped malformed prefix list entries");
    }

    Ok(lines.len() - skipped)
}

/// Fetch the prefix tables announced by `asn` and insert every valid prefix.
///
/// Returns the number of prefixes inserted.
pub async fn load_asn(
    index: &mut PrefixIndex,
    client: &reqwest::Client,
    base_url: &str,
    asn: u32,
) -> Result<usize> {
    let base = base_url.trim_end_matches('/');
    let url = format!("{base}/AS{asn}");

    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to fetch prefixes for AS{}", asn))?;

    if resp.status() != reqwest::StatusCode::OK {
        return Err(anyhow!(
            "ASN prefix query failed (status={}): {}",
            resp.status(),
            url
        ));
    }

    let body = resp
        .text()
        .await
        .with_context(|| format!("failed to read prefixes for AS{}", asn))?;

    // Html is not Send; keep parsing out of the async state.
    let prefixes = parse_asn_prefixes(&body)?;
    let skipped = index.extend_lossy(prefixes.iter().map(String::as_str));
    if skipped > 0 {
        warn!(asn, skipped, "Skipped malformed ASN prefix entries");
    }

    Ok(prefixes.len() - skipped)
}

/// Extract the prefix column of the IPv4 and IPv6 tables.
fn parse_asn_prefixes(html: &str) -> Result<Vec<String>> {
    let doc = Html::parse_document(html);
    let mut prefixes = Vec::new();

    for raw in ASN_PREFIX_SELECTORS {
        let selector =
            Selector::parse(raw).map_err(|e| anyhow!("invalid selector {}: {:?}", raw, e))?;
        prefixes.extend(
            doc.select(&selector)
                .map(|a| a.text().collect::<String>().trim().to_string())
                .filter(|text| !text.is_empty()),
        );
    }

    Ok(prefixes)
}

/// Build the admission index from every configured source.
pub async fn build_index(sources: &RangeSources, client: &reqwest::Client) -> Result<PrefixIndex> {
    let mut index = PrefixIndex::new();

    for cidr in DEFAULT_ALLOW
        .iter()
        .copied()
        .chain(sources.allow.iter().map(String::as_str))
    {
        index
            .insert_cidr(cidr)
            .with_context(|| format!("failed to add CIDR {}", cidr))?;
    }

    if sources.fetch_remote {
        for url in &sources.list_urls {
            let added = load_list(&mut index, client, url).await?;
            debug!(url = %url, added, "Loaded prefix list");
        }
        for &asn in &sources.asns {
            let added = load_asn(&mut index, client, &sources.asn_base_url, asn).await?;
            debug!(asn, added, "Loaded ASN prefixes");
        }
    }

    info!(prefixes = index.len(), "Admission index built");
    Ok(index)
}
