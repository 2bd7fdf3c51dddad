//! Aggregate counts over one probing run.

use std::collections::HashMap;

use overview_shared::{CapabilityFlag, Datasource, ProbeResult, ProbeStatus};

/// Coverage and compliance counts for a set of probe results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub endpoints_available: usize,
    pub passed: usize,
    pub failed: usize,
    pub missing: usize,
    /// Datasources whose compatibility level says they are indexed.
    pub indexed: usize,
    pub cris_with_cerif: usize,
    pub literature_with_openaire: usize,
    pub data_with_openaire_data: usize,
    /// Results supporting each flag, in [`CapabilityFlag::ALL`] order.
    pub flag_counts: Vec<(CapabilityFlag, usize)>,
}

impl ProbeSummary {
    /// Summarise `results`, joining on `datasources` for type and compatibility.
    pub fn from_results(results: &[ProbeResult], datasources: &[Datasource]) -> Self {
        let by_id: HashMap<&str, &Datasource> =
            datasources.iter().map(|d| (d.id.as_str(), d)).collect();

        let mut summary = Self {
            endpoints_available: datasources
                .iter()
                .filter(|d| !is_blank(d.oai_endpoint.as_deref()))
                .count(),
            indexed: datasources
                .iter()
                .filter(|d| is_indexed(d.compatibility.as_deref()))
                .count(),
            flag_counts: CapabilityFlag::ALL.iter().map(|f| (*f, 0)).collect(),
            ..Self::default()
        };

        for result in results {
            match result.status {
                ProbeStatus::Ok => summary.passed += 1,
                ProbeStatus::Error => summary.failed += 1,
                ProbeStatus::MissingEndpoint => summary.missing += 1,
            }

            for (flag, count) in summary.flag_counts.iter_mut() {
                if result.flags.get(*flag) {
                    *count += 1;
                }
            }

            let kind = by_id
                .get(result.entity_id.as_str())
                .and_then(|d| d.kind.as_deref())
                .unwrap_or("")
                .to_lowercase();
            if kind.contains("cris") && result.flags.get(CapabilityFlag::OaiCerifOpenaire) {
                summary.cris_with_cerif += 1;
            }
            if (kind.contains("literature") || kind.contains("institutional"))
                && result.flags.get(CapabilityFlag::OaiOpenaire)
            {
                summary.literature_with_openaire += 1;
            }
            if kind.contains("data repository") && result.flags.get(CapabilityFlag::OpenaireData) {
                summary.data_with_openaire_data += 1;
            }
        }

        summary
    }

    /// Support count for one flag.
    pub fn flag_count(&self, flag: CapabilityFlag) -> usize {
        self.flag_counts
            .iter()
            .find(|(f, _)| *f == flag)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    /// Labelled rows for display.
    pub fn rows(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("Endpoints available", self.endpoints_available),
            ("OAI test passed", self.passed),
            ("OAI test failed", self.failed),
            ("Missing endpoint", self.missing),
            ("Indexed by OpenAIRE", self.indexed),
            ("CRIS endpoints w/ CERIF", self.cris_with_cerif),
            ("Literature endpoints w/ OpenAIRE", self.literature_with_openaire),
            ("Data endpoints w/ OpenAIRE data", self.data_with_openaire_data),
            ("Endpoints w/ NL DIDL", self.flag_count(CapabilityFlag::NlDidl)),
            ("Endpoints w/ RIOXX", self.flag_count(CapabilityFlag::Rioxx)),
        ]
    }
}

fn is_blank(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => {
            let v = v.trim().to_lowercase();
            matches!(v.as_str(), "" | "nan" | "<na>" | "none" | "null")
        }
    }
}

fn is_indexed(compatibility: Option<&str>) -> bool {
    let Some(text) = compatibility.map(|c| c.trim().to_lowercase()) else {
        return false;
    };
    if text.is_empty() || text.contains("not yet") {
        return false;
    }
    text.contains("openaire") || text.contains("collected from a compatible aggregator")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use overview_shared::CapabilityFlags;
    use uuid::Uuid;

    fn result(id: &str, status: ProbeStatus, formats: &[&str]) -> ProbeResult {
        ProbeResult {
            entity_id: id.into(),
            run_id: Uuid::now_v7(),
            status,
            error: None,
            formats_detected: None,
            flags: CapabilityFlags::from_formats(formats),
            tested_at: Utc::now(),
        }
    }

    fn datasource(id: &str, kind: &str, endpoint: Option<&str>, compat: Option<&str>) -> Datasource {
        Datasource {
            id: id.into(),
            kind: Some(kind.into()),
            oai_endpoint: endpoint.map(String::from),
            compatibility: compat.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn counts_statuses_flags_and_types() {
        let datasources = vec![
            datasource("cris", "CRIS System", Some("https://cris/oai"), Some("OpenAIRE CRIS v1.1")),
            datasource(
                "lit",
                "Institutional Repository",
                Some("repo/oai"),
                Some("OpenAIRE 4.0 (inst.&thematic. repo.)"),
            ),
            datasource("data", "Data Repository", Some("null"), Some("not yet registered")),
            datasource("none", "Journal", None, Some("collected from a compatible aggregator")),
        ];
        let results = vec![
            result("cris", ProbeStatus::Ok, &["oai_dc", "oai_cerif_openaire"]),
            result("lit", ProbeStatus::Ok, &["oai_dc", "oai_openaire", "nl_didl"]),
            result("data", ProbeStatus::Error, &[]),
            result("none", ProbeStatus::MissingEndpoint, &[]),
        ];

        let summary = ProbeSummary::from_results(&results, &datasources);
        assert_eq!(summary.endpoints_available, 2);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.indexed, 3);
        assert_eq!(summary.cris_with_cerif, 1);
        assert_eq!(summary.literature_with_openaire, 1);
        assert_eq!(summary.data_with_openaire_data, 0);
        assert_eq!(summary.flag_count(CapabilityFlag::OaiDc), 2);
        assert_eq!(summary.flag_count(CapabilityFlag::NlDidl), 1);
        assert_eq!(summary.rows().len(), 10);
    }
}
