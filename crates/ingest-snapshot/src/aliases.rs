//! Caliber alias resolution (§4.H step 1): products carry whatever caliber
//! spelling a feed or scrape row used, uppercased at ingestion time but not
//! otherwise normalized. Before querying a canonical bucket, the computer
//! widens to every known alias spelling and merges the results.

/// Every raw spelling that should be folded into `canonical` when querying
/// `list_daily_best_price_per_round`. `canonical` itself is always included
/// by the caller and does not need to be repeated here.
fn raw_aliases(canonical: &str) -> &'static [&'static str] {
    match canonical {
        "9MM" => &["9X19", "9 MM", "9MM LUGER", "9MM PARA"],
        "223_REM" => &["223", ".223", ".223 REM", "223REM"],
        "308_WIN" => &["308", ".308", ".308 WIN", "308WIN"],
        "556_NATO" => &["5.56", "5.56 NATO", "556", "5.56X45"],
        "40SW" => &[".40", ".40 S&W", "40 S&W", "40 SW"],
        "45ACP" => &[".45", ".45 ACP", "45 ACP"],
        "380ACP" => &[".380", ".380 ACP", "380 ACP"],
        "22LR" => &[".22LR", ".22 LR", "22 LR"],
        "12GA" => &["12 GAUGE", "12 GA"],
        "20GA" => &["20 GAUGE", "20 GA"],
        _ => &[],
    }
}

/// All spellings (canonical key plus known aliases) to query for a
/// canonical caliber.
pub fn spellings_for(canonical: &str) -> Vec<&'static str> {
    let mut all = vec![canonical_static(canonical)];
    all.extend(raw_aliases(canonical));
    all
}

fn canonical_static(canonical: &str) -> &'static str {
    ingest_types::CANONICAL_CALIBERS
        .iter()
        .find(|&&c| c == canonical)
        .copied()
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_canonical_caliber_resolves_to_itself_at_minimum() {
        for &caliber in ingest_types::CANONICAL_CALIBERS {
            let spellings = spellings_for(caliber);
            assert!(spellings.contains(&caliber));
        }
    }

    #[test]
    fn nine_mm_widens_to_known_aliases() {
        let spellings = spellings_for("9MM");
        assert!(spellings.contains(&"9X19"));
    }
}
