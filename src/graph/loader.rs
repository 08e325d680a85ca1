//! CSV loading for the stops, lines and line-stops tables.
//!
//! Each table has a header row. Only the columns the graph needs are read:
//!
//! | table      | columns used                                              |
//! |------------|-----------------------------------------------------------|
//! | stops      | 0 id, 1 plan version, 2 short name, 3 long name, 6 lon, 7 lat |
//! | lines      | 0 id, 1 plan version, 2 short name, 3 description         |
//! | line-stops | 1 sequence, 2 orientation, 3 line id, 4 stop id           |
//!
//! Rows that are too short or hold unparsable numbers are logged and skipped.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::{info, warn};

use super::{Graph, GraphBuilder, Line, LineStop, Orientation, Stop};

/// Loads the three tables from disk and builds the graph.
///
/// # Errors
///
/// Returns an error if any file cannot be opened or is not readable CSV.
#[tracing::instrument(skip_all, fields(stops = %stops.display(), lines = %lines.display(), line_stops = %line_stops.display()))]
pub fn load_graph(stops: &Path, lines: &Path, line_stops: &Path) -> Result<Graph> {
    let open = |path: &Path| {
        File::open(path).with_context(|| format!("opening {}", path.display()))
    };
    load_graph_from_readers(open(stops)?, open(lines)?, open(line_stops)?)
}

/// Builds a graph from any three CSV sources.
///
/// # Errors
///
/// Returns an error if a source is not readable CSV.
pub fn load_graph_from_readers<S: Read, L: Read, LS: Read>(
    stops: S,
    lines: L,
    line_stops: LS,
) -> Result<Graph> {
    let mut builder = GraphBuilder::new();

    let mut stop_count = 0;
    for_each_row(stops, "stops", 8, |row| {
        builder.add_stop(parse_stop(row)?);
        stop_count += 1;
        Some(())
    })?;

    let mut line_count = 0;
    for_each_row(lines, "lines", 4, |row| {
        builder.add_line(parse_line(row)?);
        line_count += 1;
        Some(())
    })?;

    for_each_row(line_stops, "line-stops", 5, |row| {
        builder.add_line_stop(parse_line_stop(row)?);
        Some(())
    })?;

    let skipped = builder.skipped();
    let graph = builder.build();
    info!(
        stops = stop_count,
        lines = line_count,
        arcs = graph.arcs().len(),
        skipped_line_stops = skipped,
        "Graph loaded"
    );
    Ok(graph)
}

/// Feeds every data row with at least `min_fields` columns to `handle`. A
/// `None` from `handle` marks the row as malformed.
fn for_each_row<R, F>(source: R, table: &str, min_fields: usize, mut handle: F) -> Result<()>
where
    R: Read,
    F: FnMut(&StringRecord) -> Option<()>,
{
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(source);

    let mut malformed = 0usize;
    for row in reader.records() {
        let row = row.with_context(|| format!("reading {table} table"))?;
        if row.len() < min_fields || handle(&row).is_none() {
            malformed += 1;
        }
    }
    if malformed > 0 {
        warn!(table, malformed, "Skipped malformed rows");
    }
    Ok(())
}

fn field<T: FromStr>(row: &StringRecord, index: usize) -> Option<T> {
    row.get(index)?.parse().ok()
}

fn text(row: &StringRecord, index: usize) -> Option<String> {
    row.get(index).map(str::to_string)
}

fn parse_stop(row: &StringRecord) -> Option<Stop> {
    Some(Stop {
        id: field(row, 0)?,
        plan_version: field(row, 1)?,
        short_name: text(row, 2)?,
        long_name: text(row, 3)?,
        longitude: field(row, 6)?,
        latitude: field(row, 7)?,
    })
}

fn parse_line(row: &StringRecord) -> Option<Line> {
    Some(Line {
        id: field(row, 0)?,
        plan_version: field(row, 1)?,
        short_name: text(row, 2)?,
        description: text(row, 3)?,
    })
}

fn parse_line_stop(row: &StringRecord) -> Option<LineStop> {
    Some(LineStop {
        sequence: field(row, 1)?,
        orientation: Orientation::from_code(field(row, 2)?),
        line_id: field(row, 3)?,
        stop_id: field(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOPS: &str = "\
STOPID,PLANVERSIONID,SHORTNAME,LONGNAME,GPS_X,GPS_Y,DECIMALLONGITUDE,DECIMALLATITUDE
500,1,UNI,\"Universidades, Sur\",0,0,-76.5300,3.3400
501,1,CAP,Capri,0,0,-76.5310,3.3500
502,1,LID,Lido,0,0,-76.5320,3.3600
bad,1,X,X,0,0,-76.5,3.3
503,1,SHORT
";

    const LINES: &str = "\
LINEID,PLANVERSIONID,SHORTNAME,DESCRIPTION
131,1,T31,Troncal 31
";

    const LINE_STOPS: &str = "\
LINESTOPID,STOPSEQUENCE,ORIENTATION,LINEID,STOPID
1,1,0,131,500
2,2,0,131,501
3,3,0,131,502
4,1,1,131,502
5,2,1,131,500
6,1,0,999,500
7,4,0,131,12345
";

    #[test]
    fn test_load_from_readers() {
        let graph = load_graph_from_readers(
            STOPS.as_bytes(),
            LINES.as_bytes(),
            LINE_STOPS.as_bytes(),
        )
        .unwrap();

        let summary = graph.summary();
        assert_eq!(summary.stops, 3);
        assert_eq!(summary.lines, 1);
        assert_eq!(summary.arcs, 3);

        let stop = graph.stop(500).unwrap();
        assert_eq!(stop.long_name, "Universidades, Sur");
        assert!((stop.latitude - 3.34).abs() < 1e-9);
        assert!((stop.longitude + 76.53).abs() < 1e-9);

        let inbound: Vec<_> = graph
            .arcs()
            .iter()
            .filter(|a| a.orientation == Orientation::Inbound)
            .collect();
        assert_eq!(inbound.len(), 1);
        assert_eq!((inbound[0].origin, inbound[0].destination), (502, 500));
        assert_eq!(inbound[0].line_short_name, "T31");
    }

    #[test]
    fn test_missing_file_is_error() {
        let missing = Path::new("/no/such/stops.csv");
        assert!(load_graph(missing, missing, missing).is_err());
    }
}
