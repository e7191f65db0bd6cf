//! Service-side limits applied to a workflow before submission.

use crate::types::CloudFeatures;

/// Clamp a workflow to what the hosted service accepts: no
/// self-attention guidance, a bounded number of control layers per
/// conditioning block, and at most 1000 total sampling steps. Sections
/// absent from the workflow are left untouched.
pub fn apply_service_limits(workflow: &mut serde_json::Value, features: &CloudFeatures) {
    if let Some(models) = workflow.get_mut("models").and_then(|m| m.as_object_mut()) {
        models.insert(
            "self_attention_guidance".to_string(),
            serde_json::Value::Bool(false),
        );
    }

    if let Some(conditioning) = workflow.get_mut("conditioning") {
        let max = features.max_control_layers;
        if let Some(control) = conditioning.get_mut("control").and_then(|c| c.as_array_mut()) {
            control.truncate(max);
        }
        if let Some(regions) = conditioning.get_mut("regions").and_then(|r| r.as_array_mut()) {
            for region in regions {
                if let Some(control) = region.get_mut("control").and_then(|c| c.as_array_mut()) {
                    control.truncate(max);
                }
            }
        }
    }

    if let Some(sampling) = workflow.get_mut("sampling").and_then(|s| s.as_object_mut()) {
        if let Some(steps) = sampling.get("total_steps").and_then(|v| v.as_u64()) {
            sampling.insert(
                "total_steps".to_string(),
                serde_json::Value::from(steps.min(1000)),
            );
        }
    }
}
