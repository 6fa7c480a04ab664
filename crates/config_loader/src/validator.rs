//! 配置校验模块
//!
//! 校验规则：
//! - 字段范围 (`validator` derive)：超时 > 0、max_attempts >= 1、chunk_size > 0、fraction ∈ (0, 1]
//! - channels 非空、唯一、>= 1
//! - 监听端口 (base + channel) 不超出 u16
//! - ratio_min < ratio_max
//! - 五个控制端口互不相同，且不与通道监听端口冲突
//! - transfer.chunk_size 加上帧头不超过 MAX_FRAME_BYTES

use std::collections::{BTreeMap, HashSet};

use contracts::{NodeBlueprint, SyncError, MAX_CHUNK_BYTES};
use ::validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// 校验 NodeBlueprint 配置
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(blueprint: &NodeBlueprint) -> Result<(), SyncError> {
    validate_ranges(blueprint)?;
    validate_channels(blueprint)?;
    validate_ratio_bounds(blueprint)?;
    validate_ports(blueprint)?;
    validate_transfer(blueprint)?;
    Ok(())
}

/// 字段范围校验 (derive 规则)
fn validate_ranges(blueprint: &NodeBlueprint) -> Result<(), SyncError> {
    match blueprint.validate() {
        Ok(()) => Ok(()),
        Err(errors) => {
            let mut flat = BTreeMap::new();
            flatten_errors(&errors, "", &mut flat);
            let (field, message) = flat
                .into_iter()
                .next()
                .unwrap_or_else(|| ("<unknown>".to_string(), errors.to_string()));
            Err(SyncError::config_validation(field, message))
        }
    }
}

/// 展开嵌套错误为 `section.field -> message`
fn flatten_errors(errors: &ValidationErrors, prefix: &str, out: &mut BTreeMap<String, String>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                if let Some(first) = list.first() {
                    let message = match &first.message {
                        Some(message) => message.to_string(),
                        None => format!("value out of range ({})", first.code),
                    };
                    out.insert(path, message);
                }
            }
            ValidationErrorsKind::Struct(inner) => flatten_errors(inner, &path, out),
            ValidationErrorsKind::List(items) => {
                for (idx, inner) in items {
                    flatten_errors(inner, &format!("{path}[{idx}]"), out);
                }
            }
        }
    }
}

/// 校验通道集合
fn validate_channels(blueprint: &NodeBlueprint) -> Result<(), SyncError> {
    let acquisition = &blueprint.acquisition;
    let mut seen = HashSet::new();
    for channel in &acquisition.channels {
        if *channel == 0 {
            return Err(SyncError::config_validation(
                "acquisition.channels",
                "channel numbers start at 1",
            ));
        }
        if !seen.insert(*channel) {
            return Err(SyncError::config_validation(
                format!("acquisition.channels[{channel}]"),
                "duplicate channel",
            ));
        }
        if acquisition.listener_port(*channel).is_none() {
            return Err(SyncError::config_validation(
                "acquisition.listener_base_port",
                format!(
                    "listener port {} + {channel} does not fit in u16",
                    acquisition.listener_base_port
                ),
            ));
        }
    }

    for channel in &blueprint.instrument.silent_channels {
        if !seen.contains(channel) {
            return Err(SyncError::config_validation(
                "instrument.silent_channels",
                format!("channel {channel} is not in acquisition.channels"),
            ));
        }
    }
    Ok(())
}

/// 校验间隔比范围
fn validate_ratio_bounds(blueprint: &NodeBlueprint) -> Result<(), SyncError> {
    let estimation = &blueprint.estimation;
    if estimation.ratio_min >= estimation.ratio_max {
        return Err(SyncError::config_validation(
            "estimation.ratio_min / estimation.ratio_max",
            format!(
                "ratio_min ({}) must be < ratio_max ({})",
                estimation.ratio_min, estimation.ratio_max
            ),
        ));
    }
    Ok(())
}

/// 校验端口分配
fn validate_ports(blueprint: &NodeBlueprint) -> Result<(), SyncError> {
    let mut seen: BTreeMap<u16, &str> = BTreeMap::new();
    for (name, port) in blueprint.network.ports() {
        if port == 0 {
            return Err(SyncError::config_validation(
                format!("network.{name}"),
                "port must be > 0",
            ));
        }
        if let Some(other) = seen.insert(port, name) {
            return Err(SyncError::config_validation(
                format!("network.{name}"),
                format!("port {port} already used by network.{other}"),
            ));
        }
    }

    for channel in &blueprint.acquisition.channels {
        if let Some(port) = blueprint.acquisition.listener_port(*channel) {
            if let Some(other) = seen.get(&port) {
                return Err(SyncError::config_validation(
                    "acquisition.listener_base_port",
                    format!("listener port {port} (channel {channel}) collides with network.{other}"),
                ));
            }
        }
    }
    Ok(())
}

/// 单个数据块必须放得进一帧
fn validate_transfer(blueprint: &NodeBlueprint) -> Result<(), SyncError> {
    let chunk_size = blueprint.transfer.chunk_size;
    if chunk_size > MAX_CHUNK_BYTES {
        return Err(SyncError::config_validation(
            "transfer.chunk_size",
            format!("{chunk_size} bytes exceeds the {MAX_CHUNK_BYTES}-byte frame limit"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::NodeRole;

    fn minimal_blueprint() -> NodeBlueprint {
        NodeBlueprint::for_role(NodeRole::Master)
    }

    #[test]
    fn test_valid_config() {
        let bp = minimal_blueprint();
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn test_empty_channels() {
        let mut bp = minimal_blueprint();
        bp.acquisition.channels.clear();
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("acquisition.channels"), "got: {err}");
    }

    #[test]
    fn test_duplicate_channel() {
        let mut bp = minimal_blueprint();
        bp.acquisition.channels = vec![1, 2, 2];
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("duplicate channel"), "got: {err}");
    }

    #[test]
    fn test_channel_zero() {
        let mut bp = minimal_blueprint();
        bp.acquisition.channels = vec![0, 1];
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("start at 1"), "got: {err}");
    }

    #[test]
    fn test_chunk_size_fits_frame() {
        let mut bp = minimal_blueprint();
        bp.transfer.chunk_size = MAX_CHUNK_BYTES;
        assert!(validate(&bp).is_ok());

        bp.transfer.chunk_size = MAX_CHUNK_BYTES + 1;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("transfer.chunk_size"), "got: {err}");
    }

    #[test]
    fn test_listener_port_overflow() {
        let mut bp = minimal_blueprint();
        bp.acquisition.listener_base_port = u16::MAX;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("does not fit in u16"), "got: {err}");
    }

    #[test]
    fn test_fraction_out_of_range() {
        let mut bp = minimal_blueprint();
        bp.estimation.fraction = 1.5;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("estimation.fraction"), "got: {err}");
    }

    #[test]
    fn test_ratio_bounds() {
        let mut bp = minimal_blueprint();
        bp.estimation.ratio_min = 1.2;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("ratio_min"), "got: {err}");
    }

    #[test]
    fn test_zero_timeout() {
        let mut bp = minimal_blueprint();
        bp.handshake.ready_timeout_ms = 0;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("handshake.ready_timeout_ms"), "got: {err}");
    }

    #[test]
    fn test_zero_attempts() {
        let mut bp = minimal_blueprint();
        bp.handshake.max_attempts = 0;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("max_attempts"), "got: {err}");
    }

    #[test]
    fn test_zero_chunk_size() {
        let mut bp = minimal_blueprint();
        bp.transfer.chunk_size = 0;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("transfer.chunk_size"), "got: {err}");
    }

    #[test]
    fn test_duplicate_ports() {
        let mut bp = minimal_blueprint();
        bp.network.data_port = bp.network.trigger_port;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("already used"), "got: {err}");
    }

    #[test]
    fn test_listener_collides_with_control_port() {
        let mut bp = minimal_blueprint();
        bp.acquisition.listener_base_port = bp.network.command_port - 1;
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("collides"), "got: {err}");
    }

    #[test]
    fn test_silent_channel_must_be_active() {
        let mut bp = minimal_blueprint();
        bp.instrument.silent_channels = vec![7];
        let err = validate(&bp).unwrap_err().to_string();
        assert!(err.contains("silent_channels"), "got: {err}");
    }
}
