//! Screenshot annotation: numbered boxes over highlighted elements.

use eoka::Page;

use crate::surface::Highlight;
use crate::Result;

const OVERLAY_ID: &str = "__wayfarer_overlay";

/// Inject numbered overlay labels, take screenshot, remove overlays.
pub async fn annotated_screenshot(page: &Page, highlights: &[Highlight]) -> Result<Vec<u8>> {
    if highlights.is_empty() {
        return Ok(page.screenshot().await?);
    }

    page.execute(&overlay_js(highlights)?).await?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let png = page.screenshot().await;
    // Remove the overlay even if the capture failed.
    page.execute(&format!(
        "document.getElementById('{}')?.remove()",
        OVERLAY_ID
    ))
    .await?;

    Ok(png?)
}

/// Script that draws the overlay. Box data travels as JSON, so no escaping.
pub(crate) fn overlay_js(highlights: &[Highlight]) -> Result<String> {
    let data: Vec<serde_json::Value> = highlights
        .iter()
        .map(|h| {
            serde_json::json!({
                "i": h.index,
                "x": h.rect.x as i32,
                "y": h.rect.y as i32,
                "w": h.rect.width as i32,
                "h": h.rect.height as i32,
            })
        })
        .collect();

    Ok(format!(
        r#"
(() => {{
    const data = {json};
    const root = document.createElement('div');
    root.id = '{id}';
    const palette = ['#dc2626', '#2563eb', '#16a34a', '#d97706', '#7c3aed', '#db2777'];
    const vw = window.innerWidth, vh = window.innerHeight;
    const placed = [];

    for (const el of data) {{
        const color = palette[el.i % palette.length];

        const box = document.createElement('div');
        box.style.cssText = 'position:fixed;z-index:2147483646;pointer-events:none;border:1.5px solid ' + color +
            ';left:' + el.x + 'px;top:' + el.y + 'px;width:' + el.w + 'px;height:' + el.h + 'px';
        root.appendChild(box);

        // Label: top-left, top-right, bottom-left, then inside; first slot without overlap wins
        const w = String(el.i).length * 7 + 8, h = 14;
        const cx = v => Math.max(0, Math.min(v, vw - w));
        const cy = v => Math.max(0, Math.min(v, vh - h));
        const slots = [
            [cx(el.x), cy(el.y - h - 1)],
            [cx(el.x + el.w - w), cy(el.y - h - 1)],
            [cx(el.x), cy(el.y + el.h + 1)],
            [cx(el.x + 2), cy(el.y + 2)],
        ];
        let [lx, ly] = slots[0];
        for (const [sx, sy] of slots) {{
            const hit = placed.some(p => sx < p[0] + p[2] && sx + w > p[0] && sy < p[1] + p[3] && sy + h > p[1]);
            if (!hit) {{ lx = sx; ly = sy; break; }}
        }}
        placed.push([lx, ly, w, h]);

        const label = document.createElement('div');
        label.style.cssText = 'position:fixed;z-index:2147483647;pointer-events:none;color:white;' +
            'font:bold 10px/12px monospace;padding:1px 3px;border-radius:2px;white-space:nowrap;background:' + color +
            ';left:' + lx + 'px;top:' + ly + 'px';
        label.textContent = String(el.i);
        root.appendChild(label);
    }}

    document.body.appendChild(root);
}})()
"#,
        json = serde_json::to_string(&data)?,
        id = OVERLAY_ID,
    ))
}
