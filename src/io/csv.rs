/*!
# Saving Traces to CSV

Writes the draws of an [`AggregateView`] to a CSV file. Enable via the `csv` feature.
*/

use std::error::Error;
use std::fs::File;
use std::path::Path;

use csv::Writer;

use crate::aggregate::AggregateView;

/**
Saves every draw of `view` as one CSV row.

The header holds `"chain"`, `"draw"`, `"tuning"` and one column per variable
component. Scalar variables keep their name; vector variables are written as
`name[0]`, `name[1]`, and so on. Column layout is taken from the first draw of
the first chain.

# Examples

```rust
use mcmc_callback::aggregate::combine;
use mcmc_callback::io::csv::save_csv;
use mcmc_callback::trace::{ChainId, Draw, Payload, TraceWriter};

let mut writer = TraceWriter::new(ChainId(0));
let payload: Payload = [("mu", vec![0.25])].into_iter().collect();
writer.append(Draw::new(ChainId(0), 0, false, payload))?;

save_csv(&combine([writer.trace()]), "/tmp/trace.csv")?;
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub fn save_csv<P: AsRef<Path>>(view: &AggregateView, filename: P) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);

    let columns: Vec<(String, usize)> = view
        .chains()
        .find_map(|(_, draws)| draws.first())
        .map(|draw| {
            draw.payload
                .iter()
                .map(|(name, values)| (name.to_string(), values.len()))
                .collect()
        })
        .unwrap_or_default();

    let mut header: Vec<String> = vec!["chain".into(), "draw".into(), "tuning".into()];
    for (name, len) in &columns {
        if *len == 1 {
            header.push(name.clone());
        } else {
            header.extend((0..*len).map(|k| format!("{name}[{k}]")));
        }
    }
    wtr.write_record(&header)?;

    for (chain_id, draws) in view.chains() {
        for draw in draws {
            let mut row = vec![
                chain_id.to_string(),
                draw.index.to_string(),
                draw.is_tuning.to_string(),
            ];
            for (name, len) in &columns {
                let values = draw
                    .payload
                    .get(name)
                    .filter(|v| v.len() == *len)
                    .ok_or_else(|| {
                        format!("draw {} of chain {chain_id} lacks `{name}`", draw.index)
                    })?;
                row.extend(values.iter().map(|v| v.to_string()));
            }
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}
