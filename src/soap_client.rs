use crate::{
    action::{parse_soap_response, ActionReply, ActionRequest, SoapFault, SoapResponse},
    config::DlnaConfig,
    DlnaError,
};

/// Synchronous-from-the-caller SOAP action client. One call is one POST;
/// the connection is closed afterwards.
#[derive(Debug, Clone)]
pub struct SoapInvoker {
    client: reqwest::Client,
    xml_max_depth: usize,
}

impl SoapInvoker {
    pub fn new(client: reqwest::Client, config: &DlnaConfig) -> Self {
        Self {
            client,
            xml_max_depth: config.xml_max_depth,
        }
    }

    /// POST the action to its control url and classify the outcome. Peer
    /// rejections (faults, non-200) come back as an invalid [ActionReply],
    /// transport problems and unparseable responses as errors.
    pub async fn invoke(&self, request: &ActionRequest) -> Result<ActionReply, DlnaError> {
        let payload = request.envelope().map_err(DlnaError::Protocol)?;
        tracing::debug!(
            action = %request.action,
            url = %request.control_url,
            "Invoking action"
        );
        let response = self
            .client
            .post(request.control_url.clone())
            .header("SOAPACTION", request.soap_action_header())
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .header(reqwest::header::CONNECTION, "close")
            .body(payload)
            .send()
            .await?;
        let status = response.status();
        tracing::trace!(action = %request.action, status = %status, "Action response");
        let body = response.bytes().await?;

        if !status.is_success() {
            // error responses usually carry a fault body worth preserving
            let fault = match parse_soap_response(&body, self.xml_max_depth) {
                Ok(SoapResponse::Fault(fault)) => fault,
                _ => SoapFault {
                    fault_code: "s:Client".to_string(),
                    fault_string: format!("http status {status}"),
                    error_code: None,
                    error_description: None,
                },
            };
            return Ok(ActionReply::failure(Some(fault)));
        }

        match parse_soap_response(&body, self.xml_max_depth).map_err(DlnaError::Protocol)? {
            SoapResponse::Success { action, arguments } => {
                if action != request.action {
                    tracing::warn!(
                        "Response for {action} does not match invoked action {}",
                        request.action
                    );
                }
                if arguments.len() < request.expected_result_count {
                    tracing::warn!(
                        action = %request.action,
                        got = arguments.len(),
                        expected = request.expected_result_count,
                        "Response carries fewer arguments than expected"
                    );
                }
                Ok(ActionReply::success(arguments))
            }
            SoapResponse::Fault(fault) => Ok(ActionReply::failure(Some(fault))),
        }
    }
}
