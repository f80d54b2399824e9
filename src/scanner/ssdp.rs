//! SSDP/UPnP hints. Multicast M-SEARCH finds renderers that may not be in the
//! neighbour table yet; description XML supplies a model name for the TV.

use std::net::IpAddr;
use std::time::Duration;

use futures::StreamExt;

use super::SsdpResult;

const VENDOR_MARKERS: &[&str] = &["vizio", "smartcast"];

impl SsdpResult {
    /// Whether the advertisement looks like a SmartCast set
    pub fn is_smartcast(&self) -> bool {
        [&self.server, &self.friendly_name, &self.model_name]
            .into_iter()
            .flatten()
            .any(|s| {
                let lower = s.to_ascii_lowercase();
                VENDOR_MARKERS.iter().any(|m| lower.contains(m))
            })
    }

    pub fn device_info(&self) -> Option<String> {
        self.model_name.clone().or_else(|| self.friendly_name.clone())
    }
}

pub struct SsdpScanner {
    window: Duration,
    description_timeout: Duration,
}

impl SsdpScanner {
    pub fn new() -> Self {
        Self {
            window: Duration::from_secs(3),
            description_timeout: Duration::from_secs(3),
        }
    }

    /// `(friendlyName, modelName)` from the UPnP description document
    async fn describe(&self, location: &str) -> Option<(Option<String>, Option<String>)> {
        let client = reqwest::Client::builder()
            .timeout(self.description_timeout)
            .build()
            .ok()?;
        let xml = client.get(location).send().await.ok()?.text().await.ok()?;
        Some((
            extract_xml_element(&xml, "friendlyName"),
            extract_xml_element(&xml, "modelName"),
        ))
    }

    async fn search(&self) -> Vec<SsdpResult> {
        let mut responses = match ssdp_client::search(
            &ssdp_client::SearchTarget::RootDevice,
            self.window,
            2,
            None,
        )
        .await
        {
            Ok(responses) => responses,
            Err(e) => {
                tracing::warn!("SSDP search failed: {}", e);
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        while let Some(response) = responses.next().await {
            let Ok(response) = response else { continue };
            let Some(ip) = url::Url::parse(response.location())
                .ok()
                .and_then(|u| u.host_str().and_then(|h| h.parse::<IpAddr>().ok()))
            else {
                continue;
            };
            let server = response.server();
            results.push(SsdpResult {
                ip,
                location: response.location().to_string(),
                server: (!server.is_empty()).then(|| server.to_string()),
                friendly_name: None,
                model_name: None,
            });
        }
        results
    }

    /// One result per answering host, enriched from its description document
    pub async fn discover(&self) -> Vec<SsdpResult> {
        let mut results = self.search().await;
        dedup_by_ip(&mut results);

        for result in &mut results {
            if let Some((friendly_name, model_name)) = self.describe(&result.location).await {
                result.friendly_name = friendly_name;
                result.model_name = model_name;
            }
        }

        tracing::debug!("SSDP found {} host(s)", results.len());
        results
    }
}

impl Default for SsdpScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract a simple XML element value
fn extract_xml_element(xml: &str, element: &str) -> Option<String> {
    let start_tag = format!("<{}>", element);
    let end_tag = format!("</{}>", element);

    let start = xml.find(&start_tag)? + start_tag.len();
    let end = xml[start..].find(&end_tag)? + start;

    let value = xml[start..end].trim().to_string();
    if value.is_empty() { None } else { Some(value) }
}

// The same device answers once per advertised service
fn dedup_by_ip(results: &mut Vec<SsdpResult>) {
    results.sort_by(|a, b| a.ip.cmp(&b.ip));
    results.dedup_by(|a, b| a.ip == b.ip);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(ip: &str, server: Option<&str>) -> SsdpResult {
        SsdpResult {
            ip: ip.parse().unwrap(),
            location: format!("http://{}:8008/ssdp/device-desc.xml", ip),
            server: server.map(str::to_string),
            friendly_name: None,
            model_name: None,
        }
    }

    #[test]
    fn test_result_deduplication() {
        let mut results = vec![
            result("192.168.1.100", Some("Linux/3.10 UPnP/1.0")),
            result("192.168.1.101", None),
            result("192.168.1.100", None),
        ];
        dedup_by_ip(&mut results);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].ip.to_string(), "192.168.1.100");
        assert_eq!(results[1].ip.to_string(), "192.168.1.101");
    }

    #[test]
    fn test_smartcast_detection() {
        let mut tv = result("192.168.1.20", None);
        tv.model_name = Some("VIZIO M55Q7-J01".to_string());
        assert!(tv.is_smartcast());
        assert_eq!(tv.device_info().as_deref(), Some("VIZIO M55Q7-J01"));

        let printer = result("192.168.1.30", Some("HP-Chai/1.0"));
        assert!(!printer.is_smartcast());
    }

    #[test]
    fn test_extract_xml_element() {
        let xml = "<root><device><friendlyName> Living Room </friendlyName><modelName></modelName></device></root>";
        assert_eq!(
            extract_xml_element(xml, "friendlyName").as_deref(),
            Some("Living Room")
        );
        assert_eq!(extract_xml_element(xml, "modelName"), None);
        assert_eq!(extract_xml_element(xml, "serialNumber"), None);
    }
}
