use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use kres_core::CloudError;
use kres_manifest::ObjectStore;
use serde_json::Value as Json;

use crate::{CloudApi, ClusterNetwork, ExecutionNetwork, FunctionSpec};

type InvokeFn = Box<dyn Fn(&str, &Json) -> Result<Json, CloudError> + Send + Sync>;

/// In-memory cloud for tests: fixed network facts, a function registry and scripted invocations.
pub struct MockCloud {
    clusters: HashMap<String, ClusterNetwork>,
    current: Option<ExecutionNetwork>,
    internal_subnets: BTreeSet<String>,
    caller_role: String,
    functions: Mutex<BTreeSet<String>>,
    busy_invokes: Mutex<u32>,
    invoke: Option<InvokeFn>,
    objects: HashMap<(String, String), String>,
    calls: Mutex<Vec<String>>,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self {
            clusters: HashMap::new(),
            current: None,
            internal_subnets: BTreeSet::new(),
            caller_role: "arn:aws:iam::000000000000:role/kres-test".to_string(),
            functions: Mutex::new(BTreeSet::new()),
            busy_invokes: Mutex::new(0),
            invoke: None,
            objects: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(mut self, name: &str, net: ClusterNetwork) -> Self {
        self.clusters.insert(name.to_string(), net);
        self
    }

    pub fn with_current_network(mut self, net: ExecutionNetwork) -> Self {
        self.current = Some(net);
        self
    }

    pub fn with_internal_subnets(mut self, ids: &[&str]) -> Self {
        self.internal_subnets = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_function(self, name: &str) -> Self {
        self.lock_functions().insert(name.to_string());
        self
    }

    /// The next `n` invocations report the function busy.
    pub fn with_busy_invokes(self, n: u32) -> Self {
        *self.busy_invokes.lock().unwrap_or_else(|p| p.into_inner()) = n;
        self
    }

    pub fn with_invoke(mut self, f: impl Fn(&str, &Json) -> Result<Json, CloudError> + Send + Sync + 'static) -> Self {
        self.invoke = Some(Box::new(f));
        self
    }

    pub fn with_object(mut self, bucket: &str, key: &str, body: &str) -> Self {
        self.objects.insert((bucket.to_string(), key.to_string()), body.to_string());
        self
    }

    /// Calls so far, as `op:argument`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn functions(&self) -> Vec<String> {
        self.lock_functions().iter().cloned().collect()
    }

    fn lock_functions(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.functions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, op: &str, arg: &str) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(format!("{}:{}", op, arg));
    }
}

#[async_trait::async_trait]
impl ObjectStore for MockCloud {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<String, CloudError> {
        self.record("get_object", &format!("{}/{}", bucket, key));
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| CloudError::Other(format!("NoSuchKey: {}", key)))
    }
}

#[async_trait::async_trait]
impl CloudApi for MockCloud {
    async fn describe_cluster_network(&self, cluster: &str) -> Result<ClusterNetwork, CloudError> {
        self.record("describe_cluster", cluster);
        self.clusters
            .get(cluster)
            .cloned()
            .ok_or_else(|| CloudError::Other(format!("ResourceNotFoundException: No cluster found for name: {}.", cluster)))
    }

    async fn current_network(&self, function_name: &str) -> Result<ExecutionNetwork, CloudError> {
        self.record("current_network", function_name);
        self.current
            .clone()
            .ok_or_else(|| CloudError::Other(format!("ResourceNotFoundException: Function not found: {}", function_name)))
    }

    async fn internal_subnets(&self, subnet_ids: &[String]) -> Result<Vec<String>, CloudError> {
        self.record("internal_subnets", &subnet_ids.join(","));
        Ok(subnet_ids.iter().filter(|s| self.internal_subnets.contains(*s)).cloned().collect())
    }

    async fn execution_role(&self) -> Result<String, CloudError> {
        self.record("execution_role", "");
        Ok(self.caller_role.clone())
    }

    async fn create_function(&self, spec: &FunctionSpec) -> Result<(), CloudError> {
        self.record("create_function", &spec.name);
        if !self.lock_functions().insert(spec.name.clone()) {
            return Err(CloudError::AlreadyExists(format!("Function already exist: {}", spec.name)));
        }
        Ok(())
    }

    async fn update_function_code(&self, name: &str, _code_path: &Path) -> Result<(), CloudError> {
        self.record("update_function_code", name);
        Ok(())
    }

    async fn update_function_configuration(&self, spec: &FunctionSpec) -> Result<(), CloudError> {
        self.record("update_function_configuration", &spec.name);
        Ok(())
    }

    async fn invoke_function(&self, name: &str, payload: &Json) -> Result<Json, CloudError> {
        self.record("invoke", name);
        {
            let mut busy = self.busy_invokes.lock().unwrap_or_else(|p| p.into_inner());
            if *busy > 0 {
                *busy -= 1;
                return Err(CloudError::Busy("The operation cannot be performed at this time.".into()));
            }
        }
        match &self.invoke {
            Some(f) => f(name, payload),
            None => Ok(Json::String(String::new())),
        }
    }
}
