use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use kres_core::CloudError;
use kres_manifest::ObjectStore;
use kres_ops::CommandRunner;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use crate::{ClusterNetwork, CloudApi, ExecutionNetwork, FunctionSpec};

const INTERNAL_ELB_TAG: &str = "kubernetes.io/role/internal-elb";

fn q(s: &str) -> Cow<'_, str> {
    shell_escape::escape(Cow::Borrowed(s))
}

/// IAM role of the caller: `arn:aws:sts::1:assumed-role/R/session` becomes `arn:aws:iam::1:role/R`.
pub fn role_arn_from_caller(caller_arn: &str) -> String {
    let arn = caller_arn.replace(":sts:", ":iam:").replace(":assumed-role/", ":role/");
    match arn.rsplit_once('/') {
        Some((role, _session)) => role.to_string(),
        None => arn,
    }
}

/// [`CloudApi`] over the `aws` command-line tool.
pub struct AwsCli {
    runner: Arc<dyn CommandRunner>,
}

impl AwsCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn run(&self, command: String) -> Result<String, CloudError> {
        debug!(command = %command, "aws: run");
        self.runner.run(&command).await.map_err(CloudError::from)
    }

    async fn run_json<T: DeserializeOwned>(&self, command: String) -> Result<T, CloudError> {
        let out = self.run(command).await?;
        serde_json::from_str(&out).map_err(|e| CloudError::Other(format!("decoding aws output: {}", e)))
    }

    fn function_settings(spec: &FunctionSpec) -> String {
        format!(
            "--runtime {} --role {} --handler {} --timeout {} --memory-size {} --vpc-config {}",
            q(&spec.runtime),
            q(&spec.role_arn),
            q(&spec.handler),
            spec.timeout_secs,
            spec.memory_mb,
            q(&format!("SubnetIds={},SecurityGroupIds={}", spec.subnet_ids.join(","), spec.security_group_ids.join(",")))
        )
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpcConfigView {
    #[serde(default)]
    subnet_ids: Vec<String>,
    #[serde(default)]
    security_group_ids: Vec<String>,
    #[serde(default)]
    endpoint_public_access: bool,
    #[serde(default)]
    public_access_cidrs: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterView {
    resources_vpc_config: VpcConfigView,
}

#[derive(Deserialize)]
struct DescribeCluster {
    cluster: ClusterView,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct FunctionVpcView {
    #[serde(default)]
    vpc_id: Option<String>,
    #[serde(default)]
    subnet_ids: Vec<String>,
    #[serde(default)]
    security_group_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FunctionConfiguration {
    #[serde(default)]
    vpc_config: Option<FunctionVpcView>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubnetView {
    subnet_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSubnets {
    #[serde(default)]
    subnets: Vec<SubnetView>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    arn: String,
}

#[async_trait::async_trait]
impl ObjectStore for AwsCli {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<String, CloudError> {
        self.run(format!("aws s3 cp {} -", q(&format!("s3://{}/{}", bucket, key)))).await
    }
}

#[async_trait::async_trait]
impl CloudApi for AwsCli {
    async fn describe_cluster_network(&self, cluster: &str) -> Result<ClusterNetwork, CloudError> {
        let out: DescribeCluster = self.run_json(format!("aws eks describe-cluster --name {} --output json", q(cluster))).await?;
        let vpc = out.cluster.resources_vpc_config;
        Ok(ClusterNetwork {
            subnet_ids: vpc.subnet_ids.into_iter().collect(),
            security_group_ids: vpc.security_group_ids.into_iter().collect(),
            endpoint_public_access: vpc.endpoint_public_access,
            public_access_cidrs: vpc.public_access_cidrs,
        })
    }

    async fn current_network(&self, function_name: &str) -> Result<ExecutionNetwork, CloudError> {
        let out: FunctionConfiguration = self
            .run_json(format!("aws lambda get-function-configuration --function-name {} --output json", q(function_name)))
            .await?;
        let vpc = out.vpc_config.unwrap_or_default();
        Ok(ExecutionNetwork {
            vpc_id: vpc.vpc_id.filter(|v| !v.is_empty()),
            subnet_ids: vpc.subnet_ids.into_iter().collect(),
            security_group_ids: vpc.security_group_ids.into_iter().collect(),
        })
    }

    async fn internal_subnets(&self, subnet_ids: &[String]) -> Result<Vec<String>, CloudError> {
        if subnet_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Cow<'_, str>> = subnet_ids.iter().map(|s| q(s)).collect();
        let out: DescribeSubnets = self
            .run_json(format!(
                "aws ec2 describe-subnets --subnet-ids {} --filters {} --output json",
                ids.join(" "),
                q(&format!("Name=tag-key,Values={}", INTERNAL_ELB_TAG))
            ))
            .await?;
        Ok(out.subnets.into_iter().map(|s| s.subnet_id).collect())
    }

    async fn execution_role(&self) -> Result<String, CloudError> {
        let out: CallerIdentity = self.run_json("aws sts get-caller-identity --output json".to_string()).await?;
        Ok(role_arn_from_caller(&out.arn))
    }

    async fn create_function(&self, spec: &FunctionSpec) -> Result<(), CloudError> {
        let zip = format!("fileb://{}", spec.code_path.to_string_lossy());
        self.run(format!(
            "aws lambda create-function --function-name {} {} --zip-file {} --output json",
            q(&spec.name),
            Self::function_settings(spec),
            q(&zip)
        ))
        .await
        .map(|_| ())
    }

    async fn update_function_code(&self, name: &str, code_path: &Path) -> Result<(), CloudError> {
        let zip = format!("fileb://{}", code_path.to_string_lossy());
        self.run(format!("aws lambda update-function-code --function-name {} --zip-file {} --output json", q(name), q(&zip)))
            .await
            .map(|_| ())
    }

    async fn update_function_configuration(&self, spec: &FunctionSpec) -> Result<(), CloudError> {
        self.run(format!(
            "aws lambda update-function-configuration --function-name {} {} --output json",
            q(&spec.name),
            Self::function_settings(spec)
        ))
        .await
        .map(|_| ())
    }

    /// The payload travels in a file: manifests can outgrow the argument size limit.
    async fn invoke_function(&self, name: &str, payload: &Json) -> Result<Json, CloudError> {
        let body = serde_json::to_vec(payload).map_err(|e| CloudError::Other(e.to_string()))?;
        let in_file = tempfile::NamedTempFile::new().map_err(|e| CloudError::Other(format!("creating payload file: {}", e)))?;
        tokio::fs::write(in_file.path(), &body)
            .await
            .map_err(|e| CloudError::Other(format!("writing payload file: {}", e)))?;
        let out_file = tempfile::NamedTempFile::new().map_err(|e| CloudError::Other(format!("creating response file: {}", e)))?;
        let in_uri = format!("fileb://{}", in_file.path().to_string_lossy());
        let out_path = out_file.path().to_string_lossy().into_owned();
        debug!(function = %name, bytes = body.len(), "aws: invoking");
        self.run(format!(
            "aws lambda invoke --function-name {} --invocation-type RequestResponse --cli-binary-format raw-in-base64-out --payload {} {}",
            q(name),
            q(&in_uri),
            q(&out_path)
        ))
        .await?;
        let raw = tokio::fs::read(out_file.path())
            .await
            .map_err(|e| CloudError::Other(format!("reading response file: {}", e)))?;
        serde_json::from_slice(&raw).map_err(|e| CloudError::Other(format!("decoding invoke response: {}", e)))
    }
}
