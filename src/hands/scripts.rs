//! JavaScript evaluated inside the page.

/// Bumped whenever [`HELPERS_JS`] changes so stale helpers get reinstalled.
pub const HELPERS_VERSION: u32 = 2;

/// Marks elements the agent injects itself. Capture skips them and frames carrying it are
/// reported as overlays.
pub const OVERLAY_ATTR: &str = "data-navigator-overlay";

/// Reads the whole document, including same-origin frames, into the capture format:
/// `{url, viewport, root}` with `element`/`text`/`unreadable` nodes. Each element with a box
/// carries a probe: the pre-order index of whatever `elementFromPoint` reports at its center.
///
/// Read-only; nothing on the page is modified.
pub const CAPTURE_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT', 'STYLE', 'NOSCRIPT', 'TEMPLATE']);
  const OVERLAY = 'data-navigator-overlay';

  function hidden(el, win) {
    const s = win.getComputedStyle(el);
    return s.display === 'none' || s.visibility === 'hidden' || s.opacity === '0';
  }

  function readDocument(doc) {
    const win = doc.defaultView || window;
    let counter = 0;
    const indexOf = new Map();
    const probes = [];

    function readNode(node) {
      try {
        if (node.nodeType === Node.TEXT_NODE) {
          const text = node.textContent;
          if (!text || !text.trim()) return null;
          counter++;
          return { kind: 'text', text };
        }
        if (node.nodeType !== Node.ELEMENT_NODE) return null;
        if (SKIP.has(node.tagName) || node.hasAttribute(OVERLAY) && node.tagName !== 'IFRAME') return null;

        const spec = {
          kind: 'element',
          tag: node.tagName.toLowerCase(),
          attributes: [...node.attributes].map(a => [a.name, a.value]),
          rect: (() => {
            const r = node.getBoundingClientRect();
            return { x: r.x, y: r.y, width: r.width, height: r.height };
          })(),
          hidden: hidden(node, win),
          children: [],
        };
        indexOf.set(node, counter++);
        if (spec.rect.width > 0 && spec.rect.height > 0) probes.push([node, spec]);

        if (node.tagName === 'IFRAME' || node.tagName === 'FRAME') {
          if (node.hasAttribute(OVERLAY)) {
            spec.frame = { kind: 'overlay' };
          } else {
            let inner = null;
            try { inner = node.contentDocument; } catch (e) { inner = null; }
            spec.frame = inner && inner.documentElement
              ? Object.assign({ kind: 'document' }, readDocument(inner))
              : { kind: 'cross_origin', src: node.src || '' };
          }
          return spec;
        }

        for (const child of node.childNodes) {
          const read = readNode(child);
          if (read) spec.children.push(read);
        }
        return spec;
      } catch (e) {
        counter++;
        return { kind: 'unreadable', reason: String(e && e.name || e) };
      }
    }

    const root = doc.documentElement ? readNode(doc.documentElement) : null;
    for (const [node, spec] of probes) {
      const r = spec.rect;
      const hit = doc.elementFromPoint(r.x + r.width / 2, r.y + r.height / 2);
      spec.probe = { hit: hit && indexOf.has(hit) ? indexOf.get(hit) : null };
    }
    return {
      url: doc.location ? doc.location.href : '',
      viewport: { width: win.innerWidth, height: win.innerHeight },
      root,
    };
  }

  return JSON.stringify(readDocument(document));
})()
"#;

/// Installs `window.__navigator`. Addresses are locator paths; frame hops are joined by
/// `" >> "`. Hops are walked by lowercased tag name rather than handed to `document.evaluate`,
/// so nodes inside `<svg>` resolve the same way [`crate::dom::Document::evaluate_path`] finds
/// them, and elements capture leaves out are not counted. Every helper answers
/// `{ok, value}`, `{ok: false, gone: true}` when the address no longer resolves, or
/// `{ok: false, error}`.
pub const HELPERS_JS: &str = r#"
(() => {
  const VERSION = 2;
  if (window.__navigator && window.__navigator.version === VERSION) return true;

  const SKIP = new Set(['SCRIPT', 'STYLE', 'NOSCRIPT', 'TEMPLATE']);
  const OVERLAY = 'data-navigator-overlay';
  const STEP = /^([^\[\]\/]+)(?:\[(\d+)\])?$/;

  function captured(el) {
    return !SKIP.has(el.tagName) && !(el.hasAttribute(OVERLAY) && el.tagName !== 'IFRAME');
  }

  function walk(doc, path) {
    if (!path.startsWith('/')) return null;
    const steps = path.slice(1).split('/');
    let node = doc.documentElement;
    for (let i = 0; i < steps.length; i++) {
      const m = STEP.exec(steps[i].trim());
      if (!m || !node) return null;
      const tag = m[1].toLowerCase();
      const index = m[2] ? Number(m[2]) : 1;
      if (index < 1) return null;
      if (i === 0) {
        if (node.tagName.toLowerCase() !== tag || index !== 1) return null;
        continue;
      }
      const same = [...node.children].filter(c => captured(c) && c.tagName.toLowerCase() === tag);
      node = same[index - 1] || null;
    }
    return node;
  }

  function locate(address) {
    const hops = address.split(' >> ').map(s => s.trim());
    let doc = document;
    let offset = { x: 0, y: 0 };
    for (let i = 0; i < hops.length; i++) {
      const node = walk(doc, hops[i]);
      if (!node) return null;
      if (i === hops.length - 1) return { node, offset };
      let inner = null;
      try { inner = node.contentDocument; } catch (e) { inner = null; }
      if (!inner) return null;
      const r = node.getBoundingClientRect();
      offset = { x: offset.x + r.x, y: offset.y + r.y };
      doc = inner;
    }
    return null;
  }

  function withNode(address, f) {
    try {
      const found = locate(address);
      if (!found) return { ok: false, gone: true };
      return { ok: true, value: f(found.node, found.offset) };
    } catch (e) {
      return { ok: false, error: String(e && e.message || e) };
    }
  }

  function box(node, offset) {
    const r = node.getBoundingClientRect();
    return { x: r.x + offset.x, y: r.y + offset.y, width: r.width, height: r.height };
  }

  const MOUSE = new Set(['mouseover', 'mousedown', 'mouseup', 'click']);
  const KEYS = new Set(['keydown', 'keyup']);

  window.__navigator = {
    version: VERSION,

    scrollIntoView(address) {
      return withNode(address, (node, offset) => {
        node.scrollIntoView({ block: 'center', inline: 'center' });
        return box(node, offset);
      });
    },

    dispatch(address, name, key) {
      return withNode(address, node => {
        const win = node.ownerDocument.defaultView || window;
        const r = node.getBoundingClientRect();
        const at = { clientX: r.x + r.width / 2, clientY: r.y + r.height / 2 };
        let event;
        if (MOUSE.has(name)) {
          event = new win.MouseEvent(name, Object.assign({ bubbles: true, cancelable: true, view: win }, at));
        } else if (KEYS.has(name)) {
          event = new win.KeyboardEvent(name, { bubbles: true, cancelable: true, key });
        } else if (name === 'focus') {
          if (typeof node.focus === 'function') node.focus();
          event = new win.FocusEvent('focus');
        } else {
          event = new win.Event(name, { bubbles: true });
        }
        node.dispatchEvent(event);
        return null;
      });
    },

    setValue(address, value) {
      return withNode(address, node => {
        if (node.isContentEditable) {
          node.textContent = value;
          return null;
        }
        const proto = Object.getPrototypeOf(node);
        const desc = Object.getOwnPropertyDescriptor(proto, 'value');
        if (desc && desc.set) desc.set.call(node, value); else node.value = value;
        return null;
      });
    },

    value(address) {
      return withNode(address, node => node.isContentEditable ? node.textContent : (node.value ?? ''));
    },

    scrollBy(address, amount) {
      return withNode(address, node => {
        const tag = node.tagName;
        if (tag === 'HTML' || tag === 'BODY') {
          (node.ownerDocument.defaultView || window).scrollBy(0, amount);
        } else {
          node.scrollBy(0, amount);
        }
        return null;
      });
    },

    cursor(point) {
      let dot = document.getElementById('__navigator_cursor');
      if (!point) {
        if (dot) dot.style.display = 'none';
        return { ok: true, value: null };
      }
      if (!dot) {
        dot = document.createElement('div');
        dot.id = '__navigator_cursor';
        dot.setAttribute('data-navigator-overlay', '');
        dot.style.cssText = 'position:fixed;width:14px;height:14px;margin:-7px 0 0 -7px;border-radius:50%;' +
          'background:rgba(99,102,241,.7);pointer-events:none;z-index:2147483647;transition:left .15s,top .15s';
        document.documentElement.appendChild(dot);
      }
      dot.style.display = 'block';
      dot.style.left = point[0] + 'px';
      dot.style.top = point[1] + 'px';
      return { ok: true, value: null };
    },
  };
  return true;
})()
"#;

pub fn ready_check() -> String {
    format!("!!(window.__navigator && window.__navigator.version === {HELPERS_VERSION})")
}

/// `window.__navigator.<method>(<args>)`, wrapped so the result comes back as a JSON string.
pub fn call(method: &str, args: &[serde_json::Value]) -> String {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    format!(
        "JSON.stringify(window.__navigator ? window.__navigator.{method}({}) : {{ok: false, error: 'helpers missing'}})",
        args.join(", ")
    )
}
