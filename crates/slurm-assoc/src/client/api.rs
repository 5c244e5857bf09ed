//! Transport that talks to `slurmrestd`.
use chrono::NaiveDate;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::client::{
    AssociationClient, AssociationRecord, AssociationRef, ClientFuture, MutationOutcome,
    ShareRow, TransportKind, UsageRow,
};
use crate::model::{Account, Cluster, ShareMetrics, User};
use crate::node::{Node, parse_tres};
use crate::partition::{AccessList, Partition};
use crate::spec::{Spec, SpecSet};
use crate::{ROOT_ACCOUNT, SlurmError, SlurmResult};

pub const DEFAULT_API_VERSION: &str = "v0.0.40";

/// Value of `Fairshare=parent` as stored by slurmdbd.
const FAIRSHARE_PARENT: u64 = 0x7fff_ffff;

#[derive(Clone, Debug)]
pub struct ApiSettings {
    pub base_url: String,
    pub token: String,
    /// Sent as `X-SLURM-USER-NAME`, needed when the token belongs to a service account.
    pub user: Option<String>,
    pub version: String,
}

impl ApiSettings {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            user: None,
            version: DEFAULT_API_VERSION.to_string(),
        }
    }
}

/// Numbers are either plain or wrapped as `{"set": true, "infinite": false, "number": 1}`.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(untagged)]
enum ApiNumber {
    Plain(f64),
    Wrapped {
        #[serde(default)]
        set: bool,
        #[serde(default)]
        infinite: bool,
        #[serde(default)]
        number: f64,
    },
}

impl ApiNumber {
    fn value(self) -> Option<f64> {
        match self {
            ApiNumber::Plain(value) => Some(value),
            ApiNumber::Wrapped {
                set: true,
                infinite: false,
                number,
            } => Some(number),
            ApiNumber::Wrapped { .. } => None,
        }
    }
}

fn number(value: Option<ApiNumber>) -> f64 {
    value.and_then(ApiNumber::value).unwrap_or(0.0)
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    description: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorsResponse {
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiCoordinator {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiAccount {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    organization: String,
    #[serde(default)]
    coordinators: Vec<ApiCoordinator>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<ApiAccount>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiDefault {
    #[serde(default)]
    qos: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiAssociation {
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    cluster: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    id: Option<ApiNumber>,
    #[serde(default)]
    parent_account: Option<String>,
    #[serde(default)]
    shares_raw: Option<ApiNumber>,
    #[serde(default)]
    qos: Vec<String>,
    #[serde(default)]
    default: Option<ApiDefault>,
}

impl ApiAssociation {
    fn specs(&self) -> SpecSet {
        let mut specs = SpecSet::new();
        if let Some(shares) = self.shares_raw.and_then(ApiNumber::value) {
            let shares = shares as u64;
            if shares == FAIRSHARE_PARENT {
                specs.insert(Spec::new("Fairshare", "parent"));
            } else {
                specs.insert(Spec::new("Fairshare", shares.to_string()));
            }
        }
        if !self.qos.is_empty() {
            specs.insert(Spec::new("QOS", self.qos.join(",")));
        }
        if let Some(qos) = self.default.as_ref().and_then(|d| d.qos.as_deref()) {
            if !qos.is_empty() {
                specs.insert(Spec::new("DefaultQOS", qos));
            }
        }
        specs
    }
}

#[derive(Debug, Default, Deserialize)]
struct AssociationsResponse {
    #[serde(default)]
    associations: Vec<ApiAssociation>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiFairshare {
    #[serde(default)]
    factor: Option<ApiNumber>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiShare {
    #[serde(default)]
    name: String,
    #[serde(default)]
    parent: String,
    #[serde(default)]
    cluster: String,
    #[serde(default, rename = "type")]
    kind: Vec<String>,
    #[serde(default)]
    shares: Option<ApiNumber>,
    #[serde(default)]
    shares_normalized: Option<ApiNumber>,
    #[serde(default)]
    usage: Option<ApiNumber>,
    #[serde(default)]
    effective_usage: Option<ApiNumber>,
    #[serde(default)]
    fairshare: ApiFairshare,
}

#[derive(Debug, Default, Deserialize)]
struct ApiShares {
    #[serde(default)]
    shares: Vec<ApiShare>,
}

#[derive(Debug, Default, Deserialize)]
struct SharesResponse {
    #[serde(default)]
    shares: ApiShares,
}

#[derive(Debug, Default, Deserialize)]
struct ApiAllowDeny {
    #[serde(default)]
    allowed: Option<String>,
    #[serde(default)]
    deny: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiPartitionTres {
    #[serde(default)]
    billing_weights: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiPartitionNodes {
    #[serde(default)]
    configured: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiPartition {
    name: String,
    #[serde(default)]
    accounts: ApiAllowDeny,
    #[serde(default)]
    groups: ApiAllowDeny,
    #[serde(default)]
    tres: ApiPartitionTres,
    #[serde(default)]
    nodes: ApiPartitionNodes,
}

#[derive(Debug, Default, Deserialize)]
struct PartitionsResponse {
    #[serde(default)]
    partitions: Vec<ApiPartition>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiNode {
    name: String,
    #[serde(default)]
    state: Vec<String>,
    #[serde(default)]
    partitions: Vec<String>,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    cpus: Option<u32>,
    #[serde(default)]
    tres: String,
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: Vec<ApiNode>,
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

fn unquote(value: &str) -> &str {
    value.trim_matches('\'')
}

/// Maps association specs onto fields of a slurmdbd association.
/// Specs without a REST counterpart are skipped.
fn association_fields(specs: &SpecSet, body: &mut serde_json::Map<String, Value>) {
    for spec in specs {
        let value = spec.value().map(unquote).unwrap_or_default();
        match spec.key().to_ascii_lowercase().as_str() {
            "fairshare" => {
                let shares = if value.eq_ignore_ascii_case("parent") {
                    Some(FAIRSHARE_PARENT)
                } else {
                    value.parse::<u64>().ok()
                };
                if let Some(shares) = shares {
                    body.insert("shares_raw".to_string(), json!(shares));
                }
            }
            "qos" => {
                body.insert("qos".to_string(), json!(split_list(Some(value))));
            }
            "defaultqos" | "defqos" => {
                body.insert("default".to_string(), json!({ "qos": value }));
            }
            _ => log::debug!("Spec `{spec}` is not supported by the REST API, skipping it"),
        }
    }
}

pub struct ApiClient {
    cluster: String,
    settings: ApiSettings,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(cluster: impl Into<String>, settings: ApiSettings) -> Self {
        Self {
            cluster: cluster.into(),
            settings,
            http: reqwest::Client::new(),
        }
    }

    fn base(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    fn db_url(&self, path: &str) -> String {
        format!("{}/slurmdb/{}/{path}", self.base(), self.settings.version)
    }

    fn ctld_url(&self, path: &str) -> String {
        format!("{}/slurm/{}/{path}", self.base(), self.settings.version)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .header("Accept", "application/json")
            .header("X-SLURM-USER-TOKEN", &self.settings.token)
            .bearer_auth(&self.settings.token);
        if let Some(user) = &self.settings.user {
            builder = builder.header("X-SLURM-USER-NAME", user);
        }
        builder
    }

    async fn error_from(response: reqwest::Response, url: &str) -> SlurmError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let details = serde_json::from_str::<ErrorsResponse>(&text)
            .ok()
            .filter(|e| !e.errors.is_empty())
            .map(|e| {
                e.errors
                    .iter()
                    .map(|error| {
                        format!("{} {}", error.error, error.description)
                            .trim()
                            .to_string()
                    })
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or(text);
        SlurmError::Transport(format!("{url} returned {status}: {}", details.trim()))
    }

    /// GETs a JSON document. Not found answers are returned as an empty document.
    async fn get_json<T: DeserializeOwned + Default>(
        &self,
        url: String,
        query: &[(&str, String)],
    ) -> SlurmResult<T> {
        log::debug!("GET {url} {query:?}");
        let response = self.request(Method::GET, &url).query(query).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(T::default()),
            status if status.is_success() => {
                let text = response.text().await?;
                serde_json::from_str(&text).map_err(|error| {
                    SlurmError::Parse(format!("Invalid response of {url}: {error}"))
                })
            }
            _ => Err(Self::error_from(response, &url).await),
        }
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        query: &[(&str, String)],
        body: Option<Value>,
        noop: bool,
    ) -> SlurmResult<MutationOutcome> {
        let payload = format!(
            "{method} {url}{}{}",
            if query.is_empty() {
                String::new()
            } else {
                format!(
                    "?{}",
                    query
                        .iter()
                        .map(|(key, value)| format!("{key}={value}"))
                        .collect::<Vec<_>>()
                        .join("&")
                )
            },
            body.as_ref()
                .map(|body| format!(" {body}"))
                .unwrap_or_default()
        );
        if noop {
            log::info!("[noop] {payload}");
            return Ok(MutationOutcome::Simulated(payload));
        }

        log::debug!("{payload}");
        let mut request = self.request(method, &url).query(query);
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                log::warn!("{url} on cluster {}: nothing to change", self.cluster);
                Ok(MutationOutcome::Applied)
            }
            status if status.is_success() => Ok(MutationOutcome::Applied),
            _ => Err(Self::error_from(response, &url).await),
        }
    }

    async fn associations(
        &self,
        account: Option<&str>,
        user: Option<&str>,
    ) -> SlurmResult<Vec<ApiAssociation>> {
        let mut query = vec![("cluster", self.cluster.clone())];
        if let Some(account) = account {
            query.push(("account", account.to_string()));
        }
        if let Some(user) = user {
            query.push(("user", user.to_string()));
        }
        let response: AssociationsResponse =
            self.get_json(self.db_url("associations"), &query).await?;
        Ok(response
            .associations
            .into_iter()
            .filter(|assoc| assoc.cluster.is_empty() || assoc.cluster == self.cluster)
            .collect())
    }

    async fn post_associations(
        &self,
        association: Value,
        noop: bool,
    ) -> SlurmResult<MutationOutcome> {
        self.send(
            Method::POST,
            self.db_url("associations"),
            &[],
            Some(json!({ "associations": [association] })),
            noop,
        )
        .await
    }

    async fn shares(&self, accounts: &[String], users: &[String]) -> SlurmResult<Vec<ShareRow>> {
        let mut query = Vec::new();
        if !accounts.is_empty() {
            query.push(("accounts", accounts.join(",")));
        }
        if !users.is_empty() {
            query.push(("users", users.join(",")));
        }
        let response: SharesResponse = self.get_json(self.ctld_url("shares"), &query).await?;
        Ok(response
            .shares
            .shares
            .into_iter()
            .filter(|share| share.cluster.is_empty() || share.cluster == self.cluster)
            .map(|share| {
                let is_user = share.kind.iter().any(|kind| kind == "USER");
                let (account, user) = if is_user {
                    (share.parent, Some(share.name))
                } else {
                    (share.name, None)
                };
                ShareRow {
                    account,
                    user,
                    metrics: ShareMetrics {
                        raw_shares: number(share.shares),
                        normalized_shares: number(share.shares_normalized),
                        raw_usage: number(share.usage),
                        effective_usage: number(share.effective_usage),
                        fair_share: number(share.fairshare.factor),
                    },
                }
            })
            .collect())
    }
}

impl AssociationClient for ApiClient {
    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Api
    }

    fn list_accounts(
        &self,
        with_associations: bool,
        with_coordinators: bool,
    ) -> ClientFuture<'_, Vec<Account>> {
        Box::pin(async move {
            let mut query = Vec::new();
            if with_coordinators {
                query.push(("with_coords", "true".to_string()));
            }
            let response: AccountsResponse = self.get_json(self.db_url("accounts"), &query).await?;
            let associations = self.associations(None, None).await?;

            // Accounts are global in slurmdbd, only those with an association here belong to
            // this cluster.
            let mut cluster = Cluster::new(self.cluster.as_str());
            for association in &associations {
                let Some(name) = association.account.as_deref() else {
                    continue;
                };
                let account = cluster.get_or_insert_account(name);
                if association.user.is_empty() {
                    account.parent = association
                        .parent_account
                        .clone()
                        .filter(|parent| !parent.is_empty() && parent != ROOT_ACCOUNT);
                    account.specs.extend(&association.specs());
                } else if with_associations {
                    account.add_user(
                        User::new(association.user.as_str()).with_specs(association.specs()),
                    );
                }
            }
            for api_account in response.accounts {
                let Some(account) = cluster.account_mut(&api_account.name) else {
                    continue;
                };
                if !api_account.description.is_empty() {
                    account
                        .specs
                        .insert(Spec::new("Description", api_account.description));
                }
                if !api_account.organization.is_empty() {
                    account
                        .specs
                        .insert(Spec::new("Organization", api_account.organization));
                }
                account.coordinators = api_account
                    .coordinators
                    .into_iter()
                    .map(|coordinator| coordinator.name)
                    .collect();
            }
            Ok(cluster.into_accounts())
        })
    }

    fn list_partitions(&self) -> ClientFuture<'_, Vec<Partition>> {
        Box::pin(async move {
            let response: PartitionsResponse =
                self.get_json(self.ctld_url("partitions"), &[]).await?;
            Ok(response
                .partitions
                .into_iter()
                .map(|partition| {
                    let mut specs = SpecSet::new();
                    let weights = partition.tres.billing_weights.filter(|w| !w.is_empty());
                    if let Some(weights) = weights {
                        specs.insert(Spec::new(Partition::BILLING_WEIGHTS, weights));
                    }
                    Partition {
                        name: partition.name,
                        specs,
                        allowed_accounts: AccessList::parse(partition.accounts.allowed.as_deref()),
                        denied_accounts: split_list(partition.accounts.deny.as_deref()),
                        allowed_groups: split_list(partition.groups.allowed.as_deref()),
                        nodes: split_list(partition.nodes.configured.as_deref()),
                    }
                })
                .collect())
        })
    }

    fn list_nodes(&self) -> ClientFuture<'_, Vec<Node>> {
        Box::pin(async move {
            let response: NodesResponse = self.get_json(self.ctld_url("nodes"), &[]).await?;
            Ok(response
                .nodes
                .into_iter()
                .map(|node| {
                    Node::new(
                        node.name,
                        node.state,
                        node.partitions,
                        node.features,
                        node.owner.filter(|owner| !owner.is_empty()),
                        parse_tres(&node.tres),
                        node.cpus,
                    )
                })
                .collect())
        })
    }

    fn get_associations<'a>(
        &'a self,
        account: Option<&'a str>,
        user: Option<&'a str>,
    ) -> ClientFuture<'a, Vec<AssociationRecord>> {
        Box::pin(async move {
            Ok(self
                .associations(account, user)
                .await?
                .into_iter()
                .filter_map(|association| {
                    let specs = association.specs();
                    Some(AssociationRecord {
                        account: association.account?,
                        user: Some(association.user).filter(|user| !user.is_empty()),
                        id: association.id.and_then(ApiNumber::value).map(|id| id as u64),
                        specs,
                    })
                })
                .collect())
        })
    }

    fn add_association<'a>(
        &'a self,
        account: &'a str,
        user: &'a str,
        specs: &'a SpecSet,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            let mut body = serde_json::Map::new();
            body.insert("account".to_string(), json!(account));
            body.insert("cluster".to_string(), json!(self.cluster));
            body.insert("user".to_string(), json!(user));
            association_fields(specs, &mut body);
            self.post_associations(Value::Object(body), noop).await
        })
    }

    fn remove_association<'a>(
        &'a self,
        association: &'a AssociationRef,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            let query = match association {
                AssociationRef::User { account, user } => vec![
                    ("cluster", self.cluster.clone()),
                    ("account", account.clone()),
                    ("user", user.clone()),
                ],
                AssociationRef::Id(id) => vec![("id", id.to_string())],
            };
            self.send(Method::DELETE, self.db_url("association"), &query, None, noop)
                .await
        })
    }

    fn add_account<'a>(
        &'a self,
        name: &'a str,
        specs: &'a SpecSet,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            let description = specs.get("Description").map(unquote).unwrap_or(name);
            let organization = specs.get("Organization").map(unquote).unwrap_or(name);
            let account = self
                .send(
                    Method::POST,
                    self.db_url("accounts"),
                    &[],
                    Some(json!({ "accounts": [{
                        "name": name,
                        "description": description,
                        "organization": organization,
                    }]})),
                    noop,
                )
                .await?;

            let mut body = serde_json::Map::new();
            body.insert("account".to_string(), json!(name));
            body.insert("cluster".to_string(), json!(self.cluster));
            body.insert("parent_account".to_string(), json!(ROOT_ACCOUNT));
            association_fields(specs, &mut body);
            let association = self.post_associations(Value::Object(body), noop).await?;

            Ok(match (account, association) {
                (MutationOutcome::Simulated(a), MutationOutcome::Simulated(b)) => {
                    MutationOutcome::Simulated(format!("{a}\n{b}"))
                }
                _ => MutationOutcome::Applied,
            })
        })
    }

    fn remove_account<'a>(
        &'a self,
        name: &'a str,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            // Accounts are shared by all clusters of slurmdbd, so only the associations of this
            // cluster are removed.
            let query = vec![("cluster", self.cluster.clone()), ("account", name.to_string())];
            self.send(Method::DELETE, self.db_url("associations"), &query, None, noop)
                .await
        })
    }

    fn get_shares<'a>(
        &'a self,
        accounts: &'a [String],
        users: &'a [String],
    ) -> ClientFuture<'a, Vec<ShareRow>> {
        Box::pin(self.shares(accounts, users))
    }

    fn set_fairshare<'a>(
        &'a self,
        account: &'a str,
        user: Option<&'a str>,
        value: u32,
        noop: bool,
    ) -> ClientFuture<'a, MutationOutcome> {
        Box::pin(async move {
            let mut body = json!({
                "account": account,
                "cluster": self.cluster,
                "shares_raw": value,
            });
            if let Some(user) = user {
                body["user"] = json!(user);
            }
            self.post_associations(body, noop).await
        })
    }

    fn get_usage(&self, start: NaiveDate) -> ClientFuture<'_, Vec<UsageRow>> {
        Box::pin(async move {
            // slurmrestd has no usage report, the raw usage of the shares endpoint (CPU seconds,
            // subject to decay) is used instead.
            log::debug!(
                "Usage of cluster {} is read from shares, start date {start} is not applied",
                self.cluster
            );
            Ok(self
                .shares(&[], &[])
                .await?
                .into_iter()
                .filter(|row| row.account != ROOT_ACCOUNT || row.user.is_some())
                .map(|row| UsageRow {
                    account: row.account,
                    user: row.user,
                    hours: row.metrics.raw_usage / 3600.0,
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::{ApiClient, ApiSettings};
    use crate::SlurmError;
    use crate::client::{AssociationClient, AssociationRef, MutationOutcome};
    use crate::partition::AccessList;
    use crate::spec::SpecSet;

    fn client(server: &MockServer) -> ApiClient {
        let mut settings = ApiSettings::new(server.base_url(), "secret");
        settings.user = Some("slurm".to_string());
        ApiClient::new("alpha", settings)
    }

    #[tokio::test]
    async fn test_list_accounts() {
        let server = MockServer::start_async().await;
        let accounts = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/slurmdb/v0.0.40/accounts")
                    .header("X-SLURM-USER-TOKEN", "secret")
                    .header("X-SLURM-USER-NAME", "slurm");
                then.status(200).json_body(json!({
                    "accounts": [
                        {"name": "lab1", "description": "Lab one", "organization": "uni",
                         "coordinators": [{"name": "alice", "direct": true}]},
                        {"name": "root", "description": "default root account"},
                        {"name": "elsewhere"}
                    ]
                }));
            })
            .await;
        let associations = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/slurmdb/v0.0.40/associations")
                    .query_param("cluster", "alpha");
                then.status(200).json_body(json!({
                    "associations": [
                        {"account": "root", "cluster": "alpha", "user": ""},
                        {"account": "lab1", "cluster": "alpha", "user": "",
                         "parent_account": "root", "shares_raw": 100},
                        {"account": "lab1", "cluster": "alpha", "user": "alice", "id": 7,
                         "shares_raw": 2147483647, "qos": ["normal"]},
                        {"account": "lab1", "cluster": "beta", "user": "bob"}
                    ]
                }));
            })
            .await;

        let result = client(&server).list_accounts(true, true).await.unwrap();
        accounts.assert_async().await;
        associations.assert_async().await;

        let names: Vec<&str> = result.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["lab1", "root"]);
        let lab1 = &result[0];
        assert_eq!(lab1.parent, None);
        assert_eq!(lab1.specs.get("Fairshare"), Some("100"));
        assert_eq!(lab1.specs.get("Description"), Some("Lab one"));
        assert_eq!(lab1.coordinators, vec!["alice"]);
        assert_eq!(lab1.user_names().collect::<Vec<_>>(), vec!["alice"]);
        let alice = lab1.user("alice").unwrap();
        assert_eq!(alice.specs.get("Fairshare"), Some("parent"));
        assert_eq!(alice.specs.get("QOS"), Some("normal"));
    }

    #[tokio::test]
    async fn test_not_found_is_empty() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slurm/v0.0.40/partitions");
                then.status(404);
            })
            .await;
        let partitions = client(&server).list_partitions().await.unwrap();
        assert!(partitions.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_transport_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slurm/v0.0.40/nodes");
                then.status(500).json_body(json!({
                    "errors": [{"error": "Unable to contact slurmctld", "description": "timeout"}]
                }));
            })
            .await;
        let error = client(&server).list_nodes().await.unwrap_err();
        assert!(matches!(error, SlurmError::Transport(_)));
        assert!(error.to_string().contains("Unable to contact slurmctld"));
    }

    #[tokio::test]
    async fn test_list_partitions_and_nodes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slurm/v0.0.40/partitions");
                then.status(200).json_body(json!({
                    "partitions": [{
                        "name": "gpu",
                        "accounts": {"allowed": "lab1,lab3", "deny": ""},
                        "groups": {"allowed": "cluster_users"},
                        "tres": {"billing_weights": "CPU=1.0,GRES/gpu=8.0"},
                        "nodes": {"configured": "g[1-2]"}
                    }]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slurm/v0.0.40/nodes");
                then.status(200).json_body(json!({
                    "nodes": [{
                        "name": "g1", "state": ["IDLE"], "partitions": ["gpu"],
                        "features": ["a100"], "cpus": 64, "tres": "cpu=64,gres/gpu=4",
                        "owner": "lab1"
                    }]
                }));
            })
            .await;

        let client = client(&server);
        let partitions = client.list_partitions().await.unwrap();
        assert_eq!(partitions[0].name, "gpu");
        assert_eq!(
            partitions[0].allowed_accounts,
            AccessList::Names(vec!["lab1".to_string(), "lab3".to_string()])
        );
        assert!(partitions[0].denied_accounts.is_empty());
        assert_eq!(partitions[0].billing_weights(), Some("CPU=1.0,GRES/gpu=8.0"));

        let nodes = client.list_nodes().await.unwrap();
        assert_eq!(nodes[0].gpus, 4);
        assert_eq!(nodes[0].cpus, 64);
        assert_eq!(nodes[0].owner.as_deref(), Some("lab1"));
    }

    #[tokio::test]
    async fn test_get_shares() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/slurm/v0.0.40/shares")
                    .query_param("accounts", "lab1");
                then.status(200).json_body(json!({
                    "shares": {"shares": [
                        {"name": "lab1", "parent": "root", "cluster": "alpha",
                         "type": ["ASSOCIATION"],
                         "shares": {"set": true, "infinite": false, "number": 100},
                         "shares_normalized": {"set": true, "infinite": false, "number": 0.5},
                         "usage": 7200, "effective_usage": 0.1,
                         "fairshare": {"factor": 0.0, "level": 1.0}},
                        {"name": "alice", "parent": "lab1", "cluster": "alpha", "type": ["USER"],
                         "shares": {"set": false, "infinite": false, "number": 0},
                         "usage": 3600,
                         "fairshare": {"factor": {"set": true, "infinite": false, "number": 0.75}}}
                    ]}
                }));
            })
            .await;

        let accounts = vec!["lab1".to_string()];
        let rows = client(&server).get_shares(&accounts, &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].account, "lab1");
        assert_eq!(rows[0].user, None);
        assert_eq!(rows[0].metrics.raw_shares, 100.0);
        assert_eq!(rows[0].metrics.normalized_shares, 0.5);
        assert_eq!(rows[1].account, "lab1");
        assert_eq!(rows[1].user.as_deref(), Some("alice"));
        assert_eq!(rows[1].metrics.raw_shares, 0.0);
        assert_eq!(rows[1].metrics.fair_share, 0.75);
    }

    #[tokio::test]
    async fn test_add_association_posts_body() {
        let server = MockServer::start_async().await;
        let post = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/slurmdb/v0.0.40/associations")
                    .json_body(json!({"associations": [
                        {"account": "lab1", "cluster": "alpha", "user": "carol", "shares_raw": 5}
                    ]}));
                then.status(200).json_body(json!({"errors": []}));
            })
            .await;
        let specs = SpecSet::parse_joined("Fairshare=5:MaxJobs=10", ':').unwrap();
        let outcome = client(&server)
            .add_association("lab1", "carol", &specs, false)
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        post.assert_async().await;
    }

    #[tokio::test]
    async fn test_noop_sends_nothing() {
        let server = MockServer::start_async().await;
        let delete = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/slurmdb/v0.0.40/association");
                then.status(200);
            })
            .await;
        let client = client(&server);
        let outcome = client
            .remove_association(&AssociationRef::Id(12), true)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MutationOutcome::Simulated(format!(
                "DELETE {}/slurmdb/v0.0.40/association?id=12",
                server.base_url()
            ))
        );
        let outcome = client.add_account("lab9", &SpecSet::new(), true).await.unwrap();
        assert!(outcome.is_simulated());
        assert_eq!(delete.hits_async().await, 0);
    }

    #[tokio::test]
    async fn test_remove_association_by_user() {
        let server = MockServer::start_async().await;
        let delete = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/slurmdb/v0.0.40/association")
                    .query_param("cluster", "alpha")
                    .query_param("account", "lab1")
                    .query_param("user", "bob");
                then.status(200);
            })
            .await;
        let reference = AssociationRef::User {
            account: "lab1".to_string(),
            user: "bob".to_string(),
        };
        client(&server)
            .remove_association(&reference, false)
            .await
            .unwrap();
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn test_usage_from_shares() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slurm/v0.0.40/shares");
                then.status(200).json_body(json!({
                    "shares": {"shares": [
                        {"name": "root", "cluster": "alpha", "type": ["ASSOCIATION"],
                         "usage": 99999},
                        {"name": "alice", "parent": "lab1", "cluster": "alpha", "type": ["USER"],
                         "usage": 7200}
                    ]}
                }));
            })
            .await;
        let start = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rows = client(&server).get_usage(start).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user.as_deref(), Some("alice"));
        assert_eq!(rows[0].hours, 2.0);
    }
}
