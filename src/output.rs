//! Text outputs written once a run has finished.

use crate::genealogy::{Genealogy, VirusId};
use crate::phenotype::Phenotype;
use crate::simulation::Averages;
use crate::tree::{MkSummary, Range, VirusTree};
use anyhow::{Context, Result};
use std::io::Write;

fn flag(value: bool) -> u8 {
    u8::from(value)
}

fn csv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::NonNumeric)
        .from_writer(writer)
}

/// Write one CSV row per tip, preceded by a header.
pub fn write_tips<P: Phenotype, W: Write>(
    tree: &VirusTree,
    genealogy: &Genealogy<P>,
    writer: &mut W,
) -> Result<()> {
    let mut wtr = csv_writer(writer);

    let mut header = vec!["name", "year", "trunk", "tip", "mark", "location", "layout"];
    header.extend_from_slice(P::COLUMNS);
    header.extend_from_slice(&[
        "fitness",
        "averageInfectionRisk",
        "probSusceptible",
        "demeSeasonality",
    ]);
    wtr.write_record(&header).context("failed to write tips header")?;

    for &tip in tree.tips() {
        let v = genealogy.virus(tip);
        let mut record = vec![
            tip.to_string(),
            format!("{:.4}", v.birth()),
            flag(v.trunk).to_string(),
            flag(v.is_tip()).to_string(),
            flag(v.marked).to_string(),
            v.deme().to_string(),
            format!("{:.4}", v.layout),
        ];
        record.extend(genealogy.phenotype(v.phenotype()).values());
        record.extend([
            format!("{:.4}", v.fitness),
            format!("{:.4}", v.average_infection_risk),
            format!("{:.4}", v.prob_susceptible),
            format!("{:.4}", v.deme_seasonality),
        ]);
        wtr.write_record(&record)
            .with_context(|| format!("failed to write tip {tip}"))?;
    }

    wtr.flush().context("failed to flush csv writer")?;
    Ok(())
}

// `{"name",year,fitness,trunk,tip,mark,location,layout,phenotype}`
fn write_node<P: Phenotype, W: Write>(
    genealogy: &Genealogy<P>,
    node: VirusId,
    writer: &mut W,
) -> Result<()> {
    let v = genealogy.virus(node);
    write!(
        writer,
        "{{\"{}\",{:.4},{:.4},{},{},{},{},{:.4},{}}}",
        node,
        v.birth(),
        v.fitness,
        flag(v.trunk),
        flag(v.is_tip()),
        flag(v.marked),
        v.deme(),
        v.layout,
        genealogy.phenotype(v.phenotype()),
    )?;
    Ok(())
}

/// Write one line per branch of the tree: child, parent and parent coverage.
pub fn write_branches<P: Phenotype, W: Write>(
    tree: &VirusTree,
    genealogy: &Genealogy<P>,
    writer: &mut W,
) -> Result<()> {
    for node in tree.preorder(genealogy) {
        if node == tree.root() {
            continue;
        }
        let Some(parent) = genealogy.parent(node) else {
            continue;
        };
        write_node(genealogy, node, writer)?;
        write!(writer, "\t")?;
        write_node(genealogy, parent, writer)?;
        writeln!(writer, "\t{}", genealogy.virus(parent).coverage)?;
    }
    Ok(())
}

/// Write the time-averaged statistics followed by the trunk/side branch rates.
pub fn write_summary<W: Write>(
    averages: &Averages,
    end_date: f64,
    mk: &MkSummary,
    writer: &mut W,
) -> Result<()> {
    writeln!(writer, "parameter\tfull")?;
    writeln!(writer, "endDate\t{end_date:.4}")?;
    writeln!(writer, "diversity\t{:.4}", averages.diversity.mean())?;
    writeln!(writer, "tmrca\t{:.4}", averages.tmrca.mean())?;
    writeln!(writer, "netau\t{:.4}", averages.netau.mean())?;
    writeln!(writer, "serialInterval\t{:.5}", averages.serial_interval.mean())?;
    writeln!(
        writer,
        "antigenicDiversity\t{:.4}",
        averages.antigenic_diversity.mean()
    )?;
    writeln!(writer, "N\t{:.4}", averages.n.mean())?;
    writeln!(writer, "S\t{:.4}", averages.s.mean())?;
    writeln!(writer, "I\t{:.4}", averages.i.mean())?;
    writeln!(writer, "R\t{:.4}", averages.r.mean())?;
    writeln!(writer, "cases\t{:.4}", averages.cases.mean())?;
    writeln!(writer, "sideBranchRate\t{:.4}", mk.side_branch_rate)?;
    writeln!(writer, "trunkRate\t{:.4}", mk.trunk_rate)?;
    writeln!(writer, "mkRatio\t{:.4}", mk.mk_ratio)?;
    Ok(())
}

pub fn write_range<W: Write>(range: &Range, writer: &mut W) -> Result<()> {
    let record = [range.x_min, range.x_max, range.y_min, range.y_max].map(|val| format!("{val:.4}"));
    let mut wtr = csv_writer(writer);
    wtr.write_record(&record).context("failed to write range")?;
    wtr.flush().context("failed to flush csv writer")?;
    Ok(())
}
