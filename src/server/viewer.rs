//! Viewer module - generates the HTML virtual-scroll viewer for one image.
//!
//! The page sizes a spacer to the scaled image height and keeps only the
//! bands near the viewport in the DOM. On every scroll or resize it posts a
//! `ViewportChanged` to `/images/{key}/viewport`, tags the request with a
//! generation number, and ignores answers to older generations.
//!
//! Underneath the bands sits a preview: the lowest pyramid level first, then
//! whichever level the server picks for the current zoom once it has loaded.
//! A band that fails to load leaves a blank placeholder and is requested
//! again on the next report.

use crate::server::handlers::ImageMetadataResponse;

/// Escape HTML special characters to prevent XSS attacks.
fn html_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&#x27;"),
            _ => result.push(c),
        }
    }
    result
}

const TEMPLATE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>__TITLE__</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body {
            background: #1a1a1a;
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            overflow: hidden;
        }
        #scroller { position: absolute; inset: 0; overflow-y: auto; }
        #canvas { position: relative; margin: 0 auto; }
        #preview, .band { position: absolute; left: 0; width: 100%; display: block; }
        #preview { top: 0; height: 100%; filter: blur(2px); }
        .band.failed { background: #2a2a2a; outline: 1px dashed #555; outline-offset: -1px; }
        .info-panel {
            position: fixed; top: 16px; left: 16px; z-index: 10;
            background: rgba(0, 0, 0, 0.85); color: #fff;
            padding: 12px 16px; border-radius: 8px; font-size: 12px; line-height: 1.5;
            max-width: 320px;
        }
        .info-panel h2 { font-size: 14px; font-weight: 600; word-break: break-all; }
        .info-panel .meta { color: rgba(255, 255, 255, 0.7); }
        .info-panel .meta span { color: rgba(255, 255, 255, 0.95); }
        .zoom { position: fixed; bottom: 16px; right: 16px; z-index: 10; }
        .zoom button {
            width: 32px; height: 32px; margin-left: 4px; border: 0; border-radius: 6px;
            background: rgba(0, 0, 0, 0.8); color: #fff; font-size: 16px; cursor: pointer;
        }
    </style>
</head>
<body>
    <div class="info-panel">
        <h2>__NAME__</h2>
        <div class="meta">
            Dimensions: <span>__WIDTH__ &times; __HEIGHT__</span><br>
            Pages: <span>__PAGES__</span> &middot; Bands: <span>__TILE_COUNT__</span><br>
            Level: <span id="level">-</span> &middot; Held: <span id="held">0</span>
        </div>
    </div>
    <div class="zoom">
        <button id="zoom-out" title="Zoom out">&minus;</button>
        <button id="zoom-in" title="Zoom in">+</button>
    </div>
    <div id="scroller">
        <div id="canvas"><img id="preview" alt=""></div>
    </div>
    <script>
        const BASE = "__BASE_URL__/images/__KEY__";
        const IMAGE_WIDTH = __WIDTH__;
        const IMAGE_HEIGHT = __HEIGHT__;
        const TILE_HEIGHT = __TILE_HEIGHT__;
        const PREVIEW_LEVEL = __PREVIEW_LEVEL__;
        const scroller = document.getElementById('scroller');
        const canvas = document.getElementById('canvas');
        const preview = document.getElementById('preview');
        const held = new Map();
        const failed = new Map();
        let zoom = 1;
        let fit = 1;
        let generation = 0;
        let level = null;
        let pending = null;

        function scale() { return fit * zoom; }

        function layout() {
            fit = Math.min(1, scroller.clientWidth / IMAGE_WIDTH);
            canvas.style.width = (IMAGE_WIDTH * scale()) + 'px';
            canvas.style.height = (IMAGE_HEIGHT * scale()) + 'px';
            for (const [index, img] of held) { place(img, index); }
            for (const [index, img] of failed) { place(img, index); }
        }

        function showLevel(name) {
            const next = new Image();
            next.onload = () => { if (name === level || !preview.src) { preview.src = next.src; } };
            next.src = BASE + '/levels/' + encodeURIComponent(name);
        }

        function bandFailed(index, img) {
            if (held.get(index) !== img) { return; }
            held.delete(index);
            img.removeAttribute('src');
            img.classList.add('failed');
            failed.set(index, img);
            document.getElementById('held').textContent = held.size;
        }

        function place(img, index) {
            const top = index * TILE_HEIGHT;
            const rows = Math.min(TILE_HEIGHT, IMAGE_HEIGHT - top);
            img.style.top = (top * scale()) + 'px';
            img.style.height = (rows * scale()) + 'px';
        }

        function report() {
            if (pending) { return; }
            pending = requestAnimationFrame(async () => {
                pending = null;
                const current = ++generation;
                const body = {
                    scroll_top: scroller.scrollTop / scale(),
                    viewport_height: scroller.clientHeight / scale(),
                    zoom: scale(),
                };
                let plan;
                try {
                    const res = await fetch(BASE + '/viewport', {
                        method: 'POST',
                        headers: { 'Content-Type': 'application/json' },
                        body: JSON.stringify(body),
                    });
                    if (!res.ok) { return; }
                    plan = await res.json();
                } catch (e) {
                    return;
                }
                if (current !== generation) { return; }
                apply(plan);
            });
        }

        function apply(plan) {
            if (plan.level !== level) {
                level = plan.level;
                document.getElementById('level').textContent = level;
                showLevel(level);
            }
            if (!plan.request) { return; }
            const outside = (index) => index < plan.retain.start || index > plan.retain.end;
            for (const map of [held, failed]) {
                for (const [index, img] of map) {
                    if (outside(index)) {
                        img.remove();
                        map.delete(index);
                    }
                }
            }
            for (const index of plan.fetch_order) {
                if (held.has(index)) { continue; }
                if (failed.has(index)) {
                    failed.get(index).remove();
                    failed.delete(index);
                }
                const img = document.createElement('img');
                img.className = 'band';
                img.alt = '';
                img.decoding = 'async';
                img.onerror = () => bandFailed(index, img);
                img.src = BASE + '/tiles/' + index;
                place(img, index);
                canvas.appendChild(img);
                held.set(index, img);
            }
            document.getElementById('held').textContent = held.size;
        }

        function setZoom(next) {
            const center = (scroller.scrollTop + scroller.clientHeight / 2) / scale();
            zoom = Math.min(4, Math.max(0.25, next));
            layout();
            scroller.scrollTop = center * scale() - scroller.clientHeight / 2;
            report();
        }

        document.getElementById('zoom-in').onclick = () => setZoom(zoom * 1.25);
        document.getElementById('zoom-out').onclick = () => setZoom(zoom / 1.25);
        scroller.addEventListener('scroll', report, { passive: true });
        window.addEventListener('resize', () => { layout(); report(); });
        layout();
        if (PREVIEW_LEVEL) { showLevel(PREVIEW_LEVEL); }
        report();
    </script>
</body>
</html>
"##;

/// Generate the viewer page for an image.
///
/// # Arguments
///
/// * `metadata` - Image metadata as served by `GET /images/{key}`
/// * `base_url` - Base URL for API requests (e.g., "http://localhost:3000")
pub fn generate_viewer_html(metadata: &ImageMetadataResponse, base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    let encoded_key = urlencoding::encode(&metadata.key);
    let name = metadata.original_name.as_deref().unwrap_or(&metadata.key);
    let preview_level = metadata
        .levels
        .first()
        .and_then(|level| serde_json::to_string(&level.name).ok())
        .unwrap_or_else(|| "null".to_string());

    TEMPLATE
        .replace("__TITLE__", &html_escape(&format!("Viewer - {}", name)))
        .replace("__NAME__", &html_escape(name))
        .replace("__BASE_URL__", &html_escape(base_url))
        .replace("__KEY__", &encoded_key)
        .replace("__WIDTH__", &metadata.width.to_string())
        .replace("__HEIGHT__", &metadata.height.to_string())
        .replace("__PAGES__", &metadata.page_count.to_string())
        .replace("__TILE_COUNT__", &metadata.tile_count.to_string())
        .replace("__TILE_HEIGHT__", &metadata.tile_height.to_string())
        .replace("__PREVIEW_LEVEL__", &preview_level)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::OutputFormat;
    use crate::server::handlers::LevelDescriptor;

    fn test_metadata() -> ImageMetadataResponse {
        ImageMetadataResponse {
            key: "abc-300dpi-jpg-q85".to_string(),
            width: 2480,
            height: 35_000,
            format: OutputFormat::Jpeg,
            byte_size: 1024,
            page_count: 10,
            original_name: Some("report.pdf".to_string()),
            tile_height: 1000,
            tile_count: 35,
            levels: Vec::new(),
        }
    }

    #[test]
    fn test_viewer_contains_image_info() {
        let html = generate_viewer_html(&test_metadata(), "http://localhost:3000");
        assert!(html.contains("report.pdf"));
        assert!(html.contains("2480"));
        assert!(html.contains("35000"));
        assert!(html.contains("const TILE_HEIGHT = 1000;"));
    }

    #[test]
    fn test_viewer_api_base() {
        let html = generate_viewer_html(&test_metadata(), "http://localhost:3000/");
        assert!(html.contains(r#""http://localhost:3000/images/abc-300dpi-jpg-q85""#));
        assert!(html.contains("/viewport"));
        assert!(!html.contains("__"));
    }

    #[test]
    fn test_viewer_starts_from_lowest_level() {
        let mut metadata = test_metadata();
        metadata.levels = ["instant", "quick"]
            .iter()
            .map(|name| LevelDescriptor {
                name: name.to_string(),
                max_width: 400,
                quality: 60,
                width: 400,
                height: 5645,
            })
            .collect();
        let html = generate_viewer_html(&metadata, "http://localhost:3000");
        assert!(html.contains(r#"const PREVIEW_LEVEL = "instant";"#));
        // Zoom changes swap the preview instead of only relabeling it.
        assert!(html.contains("showLevel(level);"));
        assert!(!html.contains("if (!preview.src) { preview.src"));

        let html = generate_viewer_html(&test_metadata(), "http://localhost:3000");
        assert!(html.contains("const PREVIEW_LEVEL = null;"));
    }

    #[test]
    fn test_viewer_retries_failed_bands() {
        let html = generate_viewer_html(&test_metadata(), "http://localhost:3000");
        assert!(html.contains("img.onerror = () => bandFailed(index, img);"));
        assert!(html.contains("held.delete(index);"));
        assert!(html.contains(".band.failed"));
    }

    #[test]
    fn test_html_escape_special_chars() {
        assert_eq!(html_escape("<b>&\"'"), "&lt;b&gt;&amp;&quot;&#x27;");
        assert_eq!(html_escape("plain"), "plain");
    }

    #[test]
    fn test_viewer_escapes_xss_in_name() {
        let mut metadata = test_metadata();
        metadata.original_name = Some("<script>alert('x')</script>.pdf".to_string());
        let html = generate_viewer_html(&metadata, "http://localhost:3000");
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
