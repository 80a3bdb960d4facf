//! Plain-text point formats: one comma-separated point per line.

use anyhow::{Context, Result, bail};

/// A parsed point and the 1-based line it came from.
#[derive(Debug)]
pub struct NumberedPoint {
    pub line: usize,
    pub coords: Vec<f64>,
}

/// Parse CSV points, skipping blank lines and `#` comments.
pub fn parse_points(content: &str) -> Result<Vec<NumberedPoint>> {
    let mut points = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let coords = parse_coords(trimmed).with_context(|| format!("line {line}"))?;
        points.push(NumberedPoint { line, coords });
    }
    Ok(points)
}

/// Parse `"x,y;x,y"` into a list of centers.
pub fn parse_centers(text: &str) -> Result<Vec<Vec<f64>>> {
    let centers = text
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, s)| parse_coords(s).with_context(|| format!("center {}", i + 1)))
        .collect::<Result<Vec<_>>>()?;
    if centers.is_empty() {
        bail!("no centers given");
    }
    Ok(centers)
}

fn parse_coords(s: &str) -> Result<Vec<f64>> {
    s.split(',')
        .map(|field| {
            let field = field.trim();
            field
                .parse::<f64>()
                .with_context(|| format!("invalid number '{field}'"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_points_skips_comments_and_blanks() {
        let content = "# header\n1.0, 2.0\n\n  3,4  \n";
        let points = parse_points(content).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].line, 2);
        assert_eq!(points[0].coords, vec![1.0, 2.0]);
        assert_eq!(points[1].line, 4);
        assert_eq!(points[1].coords, vec![3.0, 4.0]);
    }

    #[test]
    fn test_parse_points_reports_line() {
        let err = parse_points("1,2\n3,abc\n").unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("line 2"), "{msg}");
        assert!(msg.contains("abc"), "{msg}");
    }

    #[test]
    fn test_parse_centers() {
        let centers = parse_centers("0,0; 10,10").unwrap();
        assert_eq!(centers, vec![vec![0.0, 0.0], vec![10.0, 10.0]]);
    }

    #[test]
    fn test_parse_centers_rejects_empty() {
        assert!(parse_centers(" ; ").is_err());
        assert!(parse_centers("1,x").is_err());
    }
}
