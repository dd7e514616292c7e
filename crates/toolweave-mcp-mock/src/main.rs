//! Minimal tool server speaking newline-delimited JSON-RPC over stdio.
//!
//! Tools: `echo`, `add`, `fail` (reports `isError`), `env` (reads a variable).
//! Switches:
//! - `--crash-on <tool>`: exit without answering when `<tool>` is called
//! - `--slow-tool <tool>`: sleep two seconds before answering `<tool>`

use std::io::{self, BufRead, Write};
use std::time::Duration;

use serde_json::{json, Value};

struct Options {
    crash_on: Option<String>,
    slow_tool: Option<String>,
}

fn parse_options() -> Options {
    let mut options = Options {
        crash_on: None,
        slow_tool: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--crash-on" => options.crash_on = args.next(),
            "--slow-tool" => options.slow_tool = args.next(),
            other => eprintln!("mock-mcp-server: ignoring argument {}", other),
        }
    }
    options
}

fn tools() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Echo the message back",
            "inputSchema": {
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }
        },
        {
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}}
            }
        },
        {
            "name": "fail",
            "description": "Always reports an error",
            "inputSchema": {"type": "object"}
        },
        {
            "name": "env",
            "description": "Read an environment variable",
            "inputSchema": {
                "type": "object",
                "properties": {"name": {"type": "string"}}
            }
        }
    ])
}

fn text_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}], "isError": is_error})
}

fn call_tool(params: &Value, options: &Options) -> Result<Value, (i32, String)> {
    let name = params["name"].as_str().unwrap_or_default();
    let args = &params["arguments"];

    if options.crash_on.as_deref() == Some(name) {
        std::process::exit(3);
    }
    if options.slow_tool.as_deref() == Some(name) {
        std::thread::sleep(Duration::from_secs(2));
    }

    match name {
        "echo" => match args["message"].as_str() {
            Some(message) => Ok(text_result(message, false)),
            None => Err((-32602, "Invalid params: message is required".to_string())),
        },
        "add" => {
            let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
            Ok(text_result(sum.to_string(), false))
        }
        "fail" => Ok(text_result("boom", true)),
        "env" => {
            let var = args["name"].as_str().unwrap_or_default();
            Ok(text_result(std::env::var(var).unwrap_or_default(), false))
        }
        other => Err((-32601, format!("Tool not found: {}", other))),
    }
}

fn write_line(out: &mut impl Write, value: &Value) -> io::Result<()> {
    writeln!(out, "{}", value)?;
    out.flush()
}

fn main() -> io::Result<()> {
    let options = parse_options();
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                let reply = json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": e.to_string()}});
                write_line(&mut stdout, &reply)?;
                continue;
            }
        };

        // Notifications get no reply.
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let method = request["method"].as_str().unwrap_or_default();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let outcome = match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock-mcp-server", "version": "0.1.0"}
            })),
            "tools/list" => {
                // Interleave a notification to exercise response matching.
                write_line(
                    &mut stdout,
                    &json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}}),
                )?;
                Ok(json!({"tools": tools()}))
            }
            "tools/call" => call_tool(&params, &options),
            other => Err((-32601, format!("Method not found: {}", other))),
        };

        let reply = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        };
        write_line(&mut stdout, &reply)?;
    }
    Ok(())
}
