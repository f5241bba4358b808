//! Canonical path generation from [`Params`].

use super::params::Params;

/// Rebuilds the canonical operation path (without a signature segment)
/// from parsed params. Used after the filter list is amended by base
/// params or Accept-header format negotiation.
pub fn generate(p: &Params) -> String {
    let mut parts: Vec<String> = Vec::new();
    if p.meta {
        parts.push("meta".to_string());
    }
    if p.trim {
        if p.trim_by.is_empty() {
            parts.push("trim".to_string());
        } else {
            parts.push(format!("trim:{}", p.trim_by));
        }
    }
    if p.fit_in {
        parts.push("fit-in".to_string());
    }
    if p.width != 0 || p.height != 0 || p.h_flip || p.v_flip {
        let w = if p.h_flip {
            format!("-{}", p.width)
        } else {
            p.width.to_string()
        };
        let h = if p.v_flip {
            format!("-{}", p.height)
        } else {
            p.height.to_string()
        };
        parts.push(format!("{w}x{h}"));
    }
    if !p.h_align.is_empty() {
        parts.push(p.h_align.clone());
    }
    if !p.v_align.is_empty() {
        parts.push(p.v_align.clone());
    }
    if p.smart {
        parts.push("smart".to_string());
    }
    if !p.filters.is_empty() {
        let list: Vec<String> = p
            .filters
            .iter()
            .map(|f| format!("{}({})", f.name, f.args))
            .collect();
        parts.push(format!("filters:{}", list.join(",")));
    }
    parts.push(p.image.clone());
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::super::params::Filter;
    use super::super::parse::parse;
    use super::*;

    #[test]
    fn test_generate_plain_image() {
        let p = Params {
            image: "foo.jpg".to_string(),
            ..Default::default()
        };
        assert_eq!(generate(&p), "foo.jpg");
    }

    #[test]
    fn test_generate_full_pipeline() {
        let p = Params {
            meta: true,
            trim: true,
            fit_in: true,
            width: 100,
            height: 150,
            h_flip: true,
            h_align: "left".to_string(),
            v_align: "top".to_string(),
            smart: true,
            filters: vec![Filter::new("format", "webp")],
            image: "abc.png".to_string(),
            ..Default::default()
        };
        assert_eq!(
            generate(&p),
            "meta/trim/fit-in/-100x150/left/top/smart/filters:format(webp)/abc.png"
        );
    }

    #[test]
    fn test_generate_filters_joined_with_comma() {
        let p = Params {
            fit_in: true,
            width: 200,
            filters: vec![
                Filter::new("format", "jpg"),
                Filter::new("watermark", "example.jpg"),
            ],
            image: "abc.png".to_string(),
            ..Default::default()
        };
        assert_eq!(
            generate(&p),
            "fit-in/200x0/filters:format(jpg),watermark(example.jpg)/abc.png"
        );
    }

    #[test]
    fn test_parse_generate_roundtrip() {
        for path in [
            "foo.jpg",
            "meta/foo.jpg",
            "trim:top-left/fit-in/300x200/right/bottom/smart/a/b/c.png",
            "filters:fill(255,0,0),rotate(90)/abc.png",
            "-0x-0/flip.png",
        ] {
            let parsed = parse(path);
            let regenerated = generate(&parsed);
            let reparsed = parse(&regenerated);
            assert_eq!(parsed.image, reparsed.image, "path {path}");
            assert_eq!(parsed.filters, reparsed.filters, "path {path}");
            assert_eq!(parsed.width, reparsed.width, "path {path}");
        }
    }
}
