//! report_locs 工具：把定位到的函数/代码位置 POST 到 `$LOC_REPORT_URL/report`
//!
//! 参数 schema 由 schemars 从 LocReport 生成。

use std::time::Duration;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::ToolExecutionError;
use crate::tools::{Tool, ToolArguments};

pub const LOC_REPORT_URL_ENV: &str = "LOC_REPORT_URL";

/// 一条位置报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LocReport {
    /// 相对工作区的文件路径
    pub rel_file_path: String,
    /// 函数或代码段名称
    pub func_name: String,
}

#[derive(Serialize)]
struct ReportBody<'a> {
    loc_reports: &'a [LocReport],
}

pub struct ReportLocsTool {
    http: reqwest::Client,
    base_url: Option<String>,
}

impl Default for ReportLocsTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportLocsTool {
    /// 每次执行时读取 LOC_REPORT_URL
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: None,
        }
    }

    /// 固定上报地址（优先于环境变量）
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn endpoint(&self) -> Result<String, ToolExecutionError> {
        let base = match &self.base_url {
            Some(url) => url.clone(),
            None => std::env::var(LOC_REPORT_URL_ENV).map_err(|_| {
                ToolExecutionError::Failed(format!("{} environment variable not set.", LOC_REPORT_URL_ENV))
            })?,
        };
        Ok(format!("{}/report", base.trim_end_matches('/')))
    }
}

#[async_trait]
impl Tool for ReportLocsTool {
    fn name(&self) -> &str {
        "report_locs"
    }

    fn description(&self) -> &str {
        "Report the locations of functions or code segments in files. This tool helps track and document the location of important code elements."
    }

    fn parameters_schema(&self) -> Value {
        let item = serde_json::to_value(schema_for!(LocReport)).unwrap_or(Value::Null);
        serde_json::json!({
            "type": "object",
            "properties": {
                "loc_reports": {
                    "type": "array",
                    "description": "List of location reports.",
                    "items": item
                }
            },
            "required": ["loc_reports"]
        })
    }

    async fn execute(
        &self,
        args: ToolArguments,
        cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        let raw = args.get("loc_reports").cloned().unwrap_or(Value::Null);
        let reports: Vec<LocReport> = match raw {
            Value::Null => Vec::new(),
            v => serde_json::from_value(v)
                .map_err(|e| ToolExecutionError::InvalidArguments(format!("loc_reports: {}", e)))?,
        };
        if reports.is_empty() {
            return Err(ToolExecutionError::InvalidArguments(
                "No location reports provided.".to_string(),
            ));
        }

        let url = self.endpoint()?;
        tracing::info!(url = %url, count = reports.len(), "report_locs tool execute");

        let send = self
            .http
            .post(&url)
            .json(&ReportBody {
                loc_reports: &reports,
            })
            .send();
        let response = tokio::select! {
            response = send => response,
            _ = cancel.cancelled() => return Err(ToolExecutionError::Cancelled),
        };
        response
            .and_then(|r| r.error_for_status())
            .map_err(|e| ToolExecutionError::Failed(format!("Failed to send location reports: {}", e)))?;

        Ok("Location reports sent successfully.".to_string())
    }
}
