//! Session wrapper: turns raw model-authored code into a self-contained script
//!
//! The generated script, run from the user's persistent area:
//!
//! ```text
//! 1. patch matplotlib show()/savefig() so every call also writes image.png
//! 2. restore typed variables from <conversation>.state.json (failures ignored)
//! 3. register an exit hook that writes the variables back
//! 4. run the model's code verbatim
//! ```
//!
//! The exit hook fires on normal exit and after an uncaught exception, so
//! state from a partially successful run is kept while the traceback still
//! reaches stderr. A process killed for exceeding its time budget persists
//! nothing for that round.

use super::sessions::{SESSION_STATE_VERSION, state_file_name};

/// Fixed name of the image file written by the plot interception
pub const IMAGE_FILENAME: &str = "image.png";

const PRELUDE: &str = r#"import atexit as _pa_atexit
import base64 as _pa_base64
import datetime as _pa_datetime
import json as _pa_json
import os as _pa_os
import types as _pa_types

_PA_IMAGE = __PA_IMAGE__
_PA_STATE = __PA_STATE__
_PA_CONVERSATION = __PA_CONVERSATION__
_PA_VERSION = __PA_VERSION__

try:
    import numpy as np
except ImportError:
    pass

try:
    import matplotlib as _pa_mpl
    _pa_mpl.use("Agg")
    import matplotlib.pyplot as plt

    _pa_savefig = plt.savefig

    def _pa_capture_show(func):
        def wrapper(*args, **kwargs):
            _pa_savefig(_PA_IMAGE)
            return func(*args, **kwargs)
        return wrapper

    def _pa_capture_savefig(func):
        def wrapper(*args, **kwargs):
            result = func(*args, **kwargs)
            _pa_savefig(_PA_IMAGE)
            return result
        return wrapper

    plt.show = _pa_capture_show(plt.show)
    plt.savefig = _pa_capture_savefig(plt.savefig)
except ImportError:
    pass


def _pa_decode(item):
    kind = item["type"]
    value = item.get("value")
    if kind in ("bool", "int", "float", "text"):
        return value
    if kind == "bytes":
        return _pa_base64.b64decode(value)
    if kind == "list":
        return [_pa_decode(v) for v in value]
    if kind == "map":
        return {k: _pa_decode(v) for k, v in value.items()}
    if kind == "table":
        rows = [[_pa_decode(c) for c in row] for row in value["rows"]]
        try:
            import pandas as _pa_pd
            return _pa_pd.DataFrame(rows, columns=value["columns"])
        except ImportError:
            return {"columns": value["columns"], "rows": rows}
    raise ValueError(kind)


def _pa_encode(value):
    if isinstance(value, bool):
        return {"type": "bool", "value": value}
    if isinstance(value, int):
        if -(2 ** 63) <= value < 2 ** 63:
            return {"type": "int", "value": value}
        return None
    if isinstance(value, float):
        if value != value or value in (float("inf"), float("-inf")):
            return None
        return {"type": "float", "value": value}
    if isinstance(value, str):
        return {"type": "text", "value": value}
    if isinstance(value, (bytes, bytearray)):
        return {"type": "bytes", "value": _pa_base64.b64encode(bytes(value)).decode("ascii")}
    if isinstance(value, (list, tuple)):
        items = [_pa_encode(v) for v in value]
        if any(i is None for i in items):
            return None
        return {"type": "list", "value": items}
    if isinstance(value, dict):
        if not all(isinstance(k, str) for k in value):
            return None
        entries = {k: _pa_encode(v) for k, v in value.items()}
        if any(e is None for e in entries.values()):
            return None
        return {"type": "map", "value": entries}
    try:
        import pandas as _pa_pd
        if isinstance(value, _pa_pd.DataFrame):
            rows = []
            for row in value.astype(object).values.tolist():
                cells = [_pa_encode(c) for c in row]
                if any(c is None for c in cells):
                    return None
                rows.append(cells)
            return {"type": "table", "value": {"columns": [str(c) for c in value.columns], "rows": rows}}
    except ImportError:
        pass
    if type(value).__module__ == "numpy" and hasattr(value, "tolist"):
        return _pa_encode(value.tolist())
    return None


def _pa_persist():
    values = {}
    for name, value in list(globals().items()):
        if name.startswith("_"):
            continue
        if isinstance(value, (_pa_types.ModuleType, _pa_types.FunctionType, type)):
            continue
        try:
            encoded = _pa_encode(value)
        except Exception:
            encoded = None
        if encoded is not None:
            values[name] = encoded
    document = {
        "version": _PA_VERSION,
        "conversation_id": _PA_CONVERSATION,
        "updated_at": _pa_datetime.datetime.now(_pa_datetime.timezone.utc).isoformat(),
        "values": values,
    }
    partial = _PA_STATE + ".tmp"
    with open(partial, "w") as handle:
        _pa_json.dump(document, handle)
    _pa_os.replace(partial, _PA_STATE)


if _pa_os.path.exists(_PA_STATE):
    try:
        with open(_PA_STATE) as _pa_handle:
            _pa_document = _pa_json.load(_pa_handle)
        if _pa_document.get("version") == _PA_VERSION:
            for _pa_name, _pa_item in _pa_document.get("values", {}).items():
                try:
                    globals()[_pa_name] = _pa_decode(_pa_item)
                except Exception:
                    pass
    except Exception:
        pass

_pa_atexit.register(_pa_persist)

"#;

/// Render `value` as a Python string literal.
///
/// JSON string escapes are a subset of Python's, so serde_json's encoding
/// is a valid literal.
fn py_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Wrap `code` so that it runs inside the conversation's persistent session
pub fn wrap_session(code: &str, conversation_id: &str) -> String {
    let prelude = PRELUDE
        .replace("__PA_IMAGE__", &py_str(IMAGE_FILENAME))
        .replace("__PA_STATE__", &py_str(&state_file_name(conversation_id)))
        .replace("__PA_CONVERSATION__", &py_str(conversation_id))
        .replace("__PA_VERSION__", &SESSION_STATE_VERSION.to_string());

    let mut script = prelude;
    script.push_str(code);
    if !code.ends_with('\n') {
        script.push('\n');
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_code_is_appended_verbatim() {
        let code = "\nimport math\nprint(math.pi)\n";
        let script = wrap_session(code, "conv-1");
        assert!(script.ends_with(code));
        assert_eq!(script.matches("print(math.pi)").count(), 1);
    }

    #[test]
    fn test_placeholders_are_filled() {
        let script = wrap_session("x = 1", "conv-1");
        assert!(!script.contains("__PA_"));
        assert!(script.contains(r#"_PA_IMAGE = "image.png""#));
        assert!(script.contains(r#"_PA_STATE = "conv-1.state.json""#));
        assert!(script.contains(r#"_PA_CONVERSATION = "conv-1""#));
        assert!(script.contains(&format!("_PA_VERSION = {}", SESSION_STATE_VERSION)));
        assert!(script.ends_with("x = 1\n"));
    }

    #[test]
    fn test_conversation_id_is_quoted_safely() {
        let script = wrap_session("pass", "ab\"c\\d");
        assert!(script.contains(r#"_PA_CONVERSATION = "ab\"c\\d""#));
    }

    #[test]
    fn test_persist_hook_registered_before_user_code() {
        let script = wrap_session("raise ValueError('boom')", "c");
        let hook = script.find("_pa_atexit.register(_pa_persist)").unwrap();
        let user = script.find("raise ValueError").unwrap();
        assert!(hook < user);
    }

    #[test]
    fn test_plot_interception_present() {
        let script = wrap_session("plt.plot([1, 2])\nplt.show()", "c");
        assert!(script.contains("plt.show = _pa_capture_show(plt.show)"));
        assert!(script.contains("plt.savefig = _pa_capture_savefig(plt.savefig)"));
    }
}
