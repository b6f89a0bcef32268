use super::Request;

/// Evaluate a `$variable` expression against a request.
///
/// Supported variables: `$uri`, `$args`, `$is_args`, `$host`,
/// `$request_method`, `$remote_addr`, `$http_NAME` (request header, dashes
/// written as underscores) and `$arg_NAME` (query parameter). Unknown
/// variables evaluate to the empty string.
pub fn eval(r: &Request, expr: &str) -> String {
    let mut out = String::with_capacity(expr.len() + 16);
    let bytes = expr.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            let start = i;
            while i < bytes.len() && bytes[i] != b'$' {
                i += 1;
            }
            out.push_str(&expr[start..i]);
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
            i += 1;
        }
        let name = &expr[start..i];
        append_var(r, name, &mut out);
    }

    out
}

/// True when any expression in `exprs` evaluates to a non-empty, non-"0"
/// value — the predicate form used by cache bypass / no-cache lists.
pub fn any_set(r: &Request, exprs: &[String]) -> bool {
    exprs.iter().any(|e| {
        let v = eval(r, e);
        !v.is_empty() && v != "0"
    })
}

fn append_var(r: &Request, name: &str, out: &mut String) {
    match name {
        "uri" => out.push_str(&r.uri),
        "args" => out.push_str(&r.args),
        "is_args" => {
            if !r.args.is_empty() {
                out.push('?');
            }
        }
        "host" => out.push_str(&r.host),
        "request_method" => out.push_str(r.method.as_str()),
        "remote_addr" => out.push_str(&r.client_addr.ip().to_string()),
        _ => {
            if let Some(header) = name.strip_prefix("http_") {
                let header = header.replace('_', "-");
                if let Some(v) = r.headers_in.get(&header).and_then(|v| v.to_str().ok()) {
                    out.push_str(v);
                }
            } else if let Some(arg) = name.strip_prefix("arg_") {
                if let Some(v) = query_param(&r.args, arg) {
                    out.push_str(v);
                }
            }
        }
    }
}

fn query_param<'a>(args: &'a str, name: &str) -> Option<&'a str> {
    for pair in args.split('&') {
        let mut kv = pair.splitn(2, '=');
        if kv.next() == Some(name) {
            return Some(kv.next().unwrap_or(""));
        }
    }
    None
}
