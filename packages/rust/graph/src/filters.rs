//! Filter builders and registry-identifier helpers.

use overview_shared::Metric;

/// Resource path for funding projects.
pub const PROJECTS_PATH: &str = "/v1/projects";
/// Resource path for datasources.
pub const DATASOURCES_PATH: &str = "/v1/dataSources";
/// Resource path for research products.
pub const RESEARCH_PRODUCTS_PATH: &str = "/v2/researchProducts";
/// Resource path for organisations.
pub const ORGANIZATIONS_PATH: &str = "/v1/organizations";

/// Query parameters for one graph API call.
pub type Filters = Vec<(String, String)>;

/// Which relation an entity's metrics are filtered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Organization,
    Datasource,
}

impl Scope {
    pub fn projects(&self, id: &str) -> Filters {
        match self {
            Self::Organization => pair("relOrganizationId", id),
            Self::Datasource => pair("relCollectedFromDatasourceId", id),
        }
    }

    pub fn datasources(&self, id: &str) -> Filters {
        match self {
            Self::Organization => pair("relOrganizationId", id),
            Self::Datasource => pair("id", id),
        }
    }

    /// Research-product filter, optionally narrowed to one product type.
    pub fn research_products(&self, id: &str, product_type: Option<&str>) -> Filters {
        let mut filters = match self {
            Self::Organization => pair("relOrganizationId", id),
            Self::Datasource => pair("relCollectedFromDatasourceId", id),
        };
        if let Some(t) = product_type {
            filters.push(("type".into(), t.into()));
        }
        filters
    }

    /// `(path, filters)` for a metric fetched directly from the API.
    ///
    /// [`Metric::TotalResearchProducts`] maps to an untyped product count.
    pub fn request_for(&self, metric: Metric, id: &str) -> (&'static str, Filters) {
        match metric {
            Metric::FundingProjects => (PROJECTS_PATH, self.projects(id)),
            Metric::DataSources => (DATASOURCES_PATH, self.datasources(id)),
            other => (
                RESEARCH_PRODUCTS_PATH,
                self.research_products(id, other.product_type()),
            ),
        }
    }
}

fn pair(key: &str, value: &str) -> Filters {
    vec![(key.to_string(), value.to_string())]
}

// ---------------------------------------------------------------------------
// ROR helpers
// ---------------------------------------------------------------------------

/// Turn a ROR id, bare host path or full URL into a canonical `https://ror.org/...` link.
pub fn normalise_ror_link(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.starts_with("http") {
        return Some(value.to_string());
    }
    if value.starts_with("ror.org") {
        return Some(format!("https://{value}"));
    }
    let id = value.trim_matches('/');
    if id.is_empty() {
        return None;
    }
    Some(format!("https://ror.org/{id}"))
}

/// The bare ROR id: the last path segment of a link, or the value itself.
pub fn extract_ror_id(value: &str) -> Option<String> {
    let value = value.trim().trim_end_matches('/');
    let id = value.rsplit('/').next().unwrap_or(value).trim();
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn organization_scope_filters() {
        let scope = Scope::Organization;
        assert_eq!(
            scope.projects("OID1"),
            vec![("relOrganizationId".to_string(), "OID1".to_string())]
        );
        assert_eq!(scope.datasources("OID1"), scope.projects("OID1"));
        assert_eq!(
            scope.research_products("OID1", Some("dataset")),
            vec![
                ("relOrganizationId".to_string(), "OID1".to_string()),
                ("type".to_string(), "dataset".to_string()),
            ]
        );
    }

    #[test]
    fn datasource_scope_filters() {
        let scope = Scope::Datasource;
        assert_eq!(
            scope.projects("ds1"),
            vec![("relCollectedFromDatasourceId".to_string(), "ds1".to_string())]
        );
        assert_eq!(scope.datasources("ds1"), vec![("id".to_string(), "ds1".to_string())]);

        let (path, filters) = scope.request_for(Metric::TotalResearchProducts, "ds1");
        assert_eq!(path, RESEARCH_PRODUCTS_PATH);
        assert_eq!(filters.len(), 1);

        let (path, filters) = scope.request_for(Metric::ResearchSoftware, "ds1");
        assert_eq!(path, RESEARCH_PRODUCTS_PATH);
        assert_eq!(filters[1], ("type".to_string(), "software".to_string()));
    }

    #[test]
    fn ror_link_normalisation() {
        let cases = [
            ("", None),
            ("   ", None),
            ("https://ror.org/04dkp9463", Some("https://ror.org/04dkp9463")),
            ("http://ror.org/04dkp9463", Some("http://ror.org/04dkp9463")),
            ("ror.org/04dkp9463", Some("https://ror.org/04dkp9463")),
            ("04dkp9463", Some("https://ror.org/04dkp9463")),
            ("/04dkp9463/", Some("https://ror.org/04dkp9463")),
        ];
        for (input, expected) in cases {
            assert_eq!(normalise_ror_link(input).as_deref(), expected, "input {input:?}");
        }
    }

    #[test]
    fn ror_id_extraction() {
        assert_eq!(
            extract_ror_id("https://ror.org/04dkp9463").as_deref(),
            Some("04dkp9463")
        );
        assert_eq!(extract_ror_id("https://ror.org/04dkp9463/").as_deref(), Some("04dkp9463"));
        assert_eq!(extract_ror_id("04dkp9463").as_deref(), Some("04dkp9463"));
        assert_eq!(extract_ror_id(""), None);
    }
}
