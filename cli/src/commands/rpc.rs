use super::Target;
use clap::Args;
use novm_control::{ControlConfig, ControlError, RpcClient};
use serde_json::{Map, Value};

#[derive(Args, Debug)]
pub struct RpcArgs {
    #[command(flatten)]
    pub target: Target,

    /// Call name, e.g. pause, unpause, vcpu, device, state, reload, trace
    pub method: String,

    /// Parameters as KEY=VALUE; values are read as JSON when they parse
    pub params: Vec<String>,
}

pub fn call(config: &ControlConfig, args: RpcArgs) -> Result<(), ControlError> {
    let params = parse_params(&args.params)?;
    let path = args.target.control_path(config)?;

    let mut client = RpcClient::connect(&path)?;
    let result = client.call(&args.method, params)?;

    if !result.is_null() {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

fn parse_params(params: &[String]) -> Result<Value, ControlError> {
    let mut map = Map::new();
    for param in params {
        let (key, raw) = param
            .split_once('=')
            .ok_or_else(|| ControlError::Config(format!("expected KEY=VALUE, got {:?}", param)))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(Value::Object(map))
}
