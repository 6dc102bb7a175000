use mapillary_downloader::DownloadFailurePolicy;

pub fn is_numeric_min(min: u64) -> impl Fn(String) -> Result<(), String> {
    move |v: String| {
        let val = v.parse::<u64>().map_err(|_| "must be numeric".to_owned())?;

        if val < min {
            return Err(format!("must be >= {}", min));
        }

        Ok(())
    }
}

pub fn is_geo_coord(v: String) -> Result<(), String> {
    let val = v.parse::<f64>().map_err(|_| "must be numeric".to_owned())?;

    if val < -180f64 {
        return Err("must be >= -180°".to_owned());
    } else if val > 180f64 {
        return Err("must be <= 180°".to_owned());
    }

    Ok(())
}

pub fn is_failure_policy(v: String) -> Result<(), String> {
    v.parse::<DownloadFailurePolicy>()
        .map(|_| ())
        .map_err(|e| e.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_min() {
        assert!(is_numeric_min(1)("3".to_owned()).is_ok());
        assert!(is_numeric_min(1)("0".to_owned()).is_err());
        assert!(is_numeric_min(0)("-1".to_owned()).is_err());
        assert!(is_numeric_min(0)("ten".to_owned()).is_err());
    }

    #[test]
    fn geo_coord() {
        assert!(is_geo_coord("-179.5".to_owned()).is_ok());
        assert!(is_geo_coord("180.5".to_owned()).is_err());
        assert!(is_geo_coord("north".to_owned()).is_err());
    }

    #[test]
    fn failure_policy() {
        assert!(is_failure_policy("record".to_owned()).is_ok());
        assert!(is_failure_policy("retry".to_owned()).is_err());
    }
}
